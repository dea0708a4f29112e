//! Adaptation engine: registries of dumpers and loaders, nested adapter
//! scopes, and the per-query [`Transformer`].
//!
//! The registry stores codec *constructors*, never instances: a dumper
//! is built per transformer for the type it matched, a loader for the
//! column oid and type modifier it decodes. Lookup walks the scope
//! chain from the most specific map to the process-global one; the
//! first hit wins.

mod transform;


pub use transform::Transformer;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::errors::Error;
use crate::pq::{Format, Oid};

/// A value decoded from the wire. Callers downcast to the concrete type
/// the loader documents.
pub type HostValue = Box<dyn Any + Send>;

/// Identity of a host type: its `TypeId` plus the fully qualified name
/// (`std::any::type_name`) used for forward references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTag {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> TypeTag {
        TypeTag {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// A value the engine can dump.
///
/// `lineage` lists the type and its declared ancestors, most specific
/// first: registering a dumper for an ancestor makes it resolve for
/// every descendant unless a more specific registration exists.
/// `as_ancestor` must answer for every tag in the lineage, so a dumper
/// registered on an ancestor can view the value as that type.
pub trait Adaptable: Any + Send {
    fn tag(&self) -> TypeTag;

    fn lineage(&self) -> Vec<TypeTag> {
        vec![self.tag()]
    }

    fn as_ancestor(&self, ancestor: TypeId) -> Option<&dyn Any>;
}

/// View `value` as `T`, the type the calling dumper was registered
/// under (the value's own type or one of its declared ancestors).
pub fn downcast_value<'a, T: 'static>(
    value: &'a dyn Adaptable,
    dumper: &str,
) -> Result<&'a T, Error> {
    value
        .as_ancestor(TypeId::of::<T>())
        .and_then(|v| v.downcast_ref::<T>())
        .ok_or_else(|| {
            Error::Internal(format!("{dumper} dumper cannot view {}", value.tag().name))
        })
}

/// Server-side escaping, reachable while a live connection is around.
pub trait Escaping: Send + Sync {
    /// Escape a value as a complete SQL literal.
    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error>;

    /// Escape a value for embedding between single quotes.
    fn escape_string(&self, value: &[u8]) -> Vec<u8>;
}

/// Conservative connection-less escaping: doubled quotes and
/// backslashes.
pub(crate) fn escape_string_fallback(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for &b in value {
        if b == b'\'' || b == b'\\' {
            out.push(b);
        }
        out.push(b);
    }
    out
}

impl std::fmt::Debug for dyn Dump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Dump>")
    }
}

/// Out-going codec for one host type and format.
pub trait Dump: Send + Sync {
    fn dump(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error>;

    /// The escaping handle this dumper was built with, if any.
    fn escaping(&self) -> Option<&Arc<dyn Escaping>> {
        None
    }

    /// Escape `value` for inline SQL use. With a connection around this
    /// round-trips through the server's literal escaping; without, a
    /// conservative quoted form.
    fn quote(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error> {
        let raw = self.dump(value)?;
        match self.escaping() {
            Some(esc) => esc.escape_literal(&raw),
            None => {
                let mut out = vec![b'\''];
                out.extend_from_slice(&escape_string_fallback(&raw));
                out.push(b'\'');
                Ok(out)
            }
        }
    }

    /// Oid this dumper stamps on its parameters; 0 lets the server
    /// infer.
    fn oid(&self) -> Oid {
        0
    }
}

/// In-coming codec for one column oid and format. Instances carry the
/// oid and type modifier they were resolved for.
pub trait Load: Send + Sync {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error>;

    fn oid(&self) -> Oid;

    fn fmod(&self) -> i32 {
        -1
    }
}

/// Constructor for a dumper, receiving the matched type tag and the
/// transformer asking for it.
pub type DumperFactory = Arc<dyn Fn(&TypeTag, &Transformer) -> Arc<dyn Dump> + Send + Sync>;

/// Constructor for a loader, receiving the column oid, the type
/// modifier, and the transformer asking for it.
pub type LoaderFactory = Arc<dyn Fn(Oid, i32, &Transformer) -> Arc<dyn Load> + Send + Sync>;

/// Dumper map key: a concrete type, or a fully qualified type name used
/// as a forward reference and aliased to the type key on first lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DumperKey {
    Type(TypeId),
    Name(String),
}

impl From<TypeTag> for DumperKey {
    fn from(tag: TypeTag) -> DumperKey {
        DumperKey::Type(tag.id)
    }
}

impl From<&str> for DumperKey {
    fn from(name: &str) -> DumperKey {
        DumperKey::Name(name.to_owned())
    }
}

/// One adapter scope: codec constructors keyed by `(type-or-name,
/// format)` for dumpers and `(oid, format)` for loaders.
#[derive(Default)]
pub struct AdapterMap {
    dumpers: HashMap<(DumperKey, Format), DumperFactory>,
    loaders: HashMap<(Oid, Format), LoaderFactory>,
}

impl AdapterMap {
    pub(crate) fn insert_dumper(&mut self, key: DumperKey, format: Format, factory: DumperFactory) {
        self.dumpers.insert((key, format), factory);
    }

    pub(crate) fn insert_loader(&mut self, oid: Oid, format: Format, factory: LoaderFactory) {
        self.loaders.insert((oid, format), factory);
    }

    pub(crate) fn dumper(&self, key: &(DumperKey, Format)) -> Option<&DumperFactory> {
        self.dumpers.get(key)
    }

    pub(crate) fn loader(&self, key: &(Oid, Format)) -> Option<&LoaderFactory> {
        self.loaders.get(key)
    }
}

/// One level of the adapter lookup chain.
pub type ScopeMap = Arc<RwLock<AdapterMap>>;

pub(crate) fn new_scope() -> ScopeMap {
    Arc::new(RwLock::new(AdapterMap::default()))
}

/// Process-global adapter registry. Builtin codecs are installed on
/// first touch; later mutation must happen before queries are in
/// flight.
pub fn global_adapters() -> &'static ScopeMap {
    static GLOBALS: Lazy<ScopeMap> = Lazy::new(|| {
        let mut map = AdapterMap::default();
        crate::types::builtins::register_builtins(&mut map);
        Arc::new(RwLock::new(map))
    });
    &GLOBALS
}

/// A scope adapter lookups can start from: a connection, a cursor, or
/// another transformer.
pub trait AdaptContext {
    /// Scope maps, innermost first, excluding the global registry unless
    /// [`AdaptContext::chain_is_complete`].
    fn scope_chain(&self) -> Vec<ScopeMap>;

    /// The map `register_*(…, context, …)` writes into.
    fn local_scope(&self) -> ScopeMap;

    /// True when `scope_chain` already ends with the global registry (a
    /// transformer sharing its maps with sub-transformers).
    fn chain_is_complete(&self) -> bool {
        false
    }

    fn escaping(&self) -> Option<Arc<dyn Escaping>> {
        None
    }
}

/// Install a dumper constructor for `key`/`format` into `context`'s own
/// scope, or the global registry when `context` is `None`.
pub fn register_dumper(
    key: impl Into<DumperKey>,
    format: Format,
    factory: DumperFactory,
    context: Option<&dyn AdaptContext>,
) -> Result<(), Error> {
    let key = key.into();
    if let DumperKey::Name(name) = &key {
        if name.is_empty() {
            return Err(Error::Registration(
                "dumpers are registered on a type or its qualified name, got an empty name"
                    .into(),
            ));
        }
    }
    let scope = match context {
        Some(ctx) => ctx.local_scope(),
        None => global_adapters().clone(),
    };
    scope.write().insert_dumper(key, format, factory);
    Ok(())
}

/// Install a loader constructor for `oid`/`format` into `context`'s own
/// scope, or the global registry when `context` is `None`.
pub fn register_loader(
    oid: Oid,
    format: Format,
    factory: LoaderFactory,
    context: Option<&dyn AdaptContext>,
) -> Result<(), Error> {
    let scope = match context {
        Some(ctx) => ctx.local_scope(),
        None => global_adapters().clone(),
    };
    scope.write().insert_loader(oid, format, factory);
    Ok(())
}
