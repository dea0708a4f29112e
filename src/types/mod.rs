//! Host-side value types, builtin scalar codecs and catalog metadata.

pub mod builtins;
pub mod composite;
pub mod oids;


use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::adapt::{Adaptable, HostValue, TypeTag};
use crate::errors::Error;
use crate::pq::Oid;

pub(crate) fn utf8(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|_| Error::Data("text value is not valid UTF-8".into()))
}

/// A positional record decoded from the wire: one entry per field,
/// `None` for SQL nulls.
pub struct Row(pub Vec<Option<HostValue>>);

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row").field("len", &self.0.len()).finish()
    }
}

impl Row {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.0.get(index), Some(None))
    }

    /// Field `index` downcast to `T`; `None` when null, out of range, or
    /// of another type.
    pub fn get<T: 'static>(&self, index: usize) -> Option<&T> {
        self.0.get(index)?.as_ref()?.downcast_ref()
    }
}

/// A named-field composite value, the default factory output of a
/// registered composite type.
pub struct Composite {
    pub type_name: String,
    pub field_names: Arc<[String]>,
    pub fields: Vec<Option<HostValue>>,
}

impl Composite {
    pub fn get<T: 'static>(&self, index: usize) -> Option<&T> {
        self.fields.get(index)?.as_ref()?.downcast_ref()
    }

    /// Field looked up by its catalog name.
    pub fn field<T: 'static>(&self, name: &str) -> Option<&T> {
        let index = self.field_names.iter().position(|n| n == name)?;
        self.get(index)
    }
}

/// The host-side tuple the tuple dumper consumes: an ordered sequence
/// of adaptable values, `None` for SQL nulls.
pub struct Record(pub Vec<Option<Box<dyn Adaptable>>>);

/// Catalog identity of a server type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub oid: Oid,
    pub array_oid: Oid,
}

macro_rules! adaptable_leaf {
    ($($ty:ty),* $(,)?) => {$(
        impl Adaptable for $ty {
            fn tag(&self) -> TypeTag {
                TypeTag::of::<$ty>()
            }

            fn as_ancestor(&self, ancestor: TypeId) -> Option<&dyn Any> {
                (ancestor == TypeId::of::<$ty>()).then_some(self as &dyn Any)
            }
        }
    )*};
}

adaptable_leaf!(bool, i16, i32, i64, f64, String, Vec<u8>, Record);
