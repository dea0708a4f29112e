//! Per-query adaptation session.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::Error;
use crate::pq::{Format, Oid, PgResult};
use crate::types::{oids, Row};

use super::{
    global_adapters, new_scope, AdaptContext, Adaptable, Dump, DumperFactory, DumperKey, Escaping,
    Load, ScopeMap, TypeTag,
};

/// Adapts values between host types and their wire representation for
/// the duration of one query.
///
/// The session assumes connection-wide facts (encoding, server version)
/// do not change while it lives, so resolved codecs are cached: dumpers
/// by concrete type and format, loaders by oid, format and type
/// modifier. A transformer created from another transformer shares the
/// parent's entire scope chain, which is what makes recursive composite
/// decoding reuse every registration without re-probing.
pub struct Transformer {
    scopes: Vec<ScopeMap>,
    escaping: Option<Arc<dyn Escaping>>,
    dumpers_cache: HashMap<(TypeId, Format), Arc<dyn Dump>>,
    loaders_cache: HashMap<(Oid, Format, i32), Arc<dyn Load>>,
    row_loaders: Vec<Arc<dyn Load>>,
    result: Option<Arc<dyn PgResult>>,
    nfields: usize,
    ntuples: usize,
}

impl Transformer {
    /// A transformer rooted at `context`; `None` sees only its own
    /// query-local scope plus the global registry.
    pub fn new(context: Option<&dyn AdaptContext>) -> Transformer {
        let (scopes, escaping) = match context {
            None => (vec![new_scope(), global_adapters().clone()], None),
            Some(ctx) => {
                let escaping = ctx.escaping();
                let scopes = if ctx.chain_is_complete() {
                    ctx.scope_chain()
                } else {
                    let mut scopes = vec![new_scope()];
                    scopes.extend(ctx.scope_chain());
                    scopes.push(global_adapters().clone());
                    scopes
                };
                (scopes, escaping)
            }
        };
        Transformer {
            scopes,
            escaping,
            dumpers_cache: HashMap::new(),
            loaders_cache: HashMap::new(),
            row_loaders: Vec::new(),
            result: None,
            nfields: 0,
            ntuples: 0,
        }
    }

    pub fn escaping(&self) -> Option<Arc<dyn Escaping>> {
        self.escaping.clone()
    }

    pub fn pgresult(&self) -> Option<&Arc<dyn PgResult>> {
        self.result.as_ref()
    }

    /// Columns of the attached result.
    pub fn nfields(&self) -> usize {
        self.nfields
    }

    /// Rows of the attached result.
    pub fn ntuples(&self) -> usize {
        self.ntuples
    }

    /// Attach (or detach) the result this transformer decodes. The row
    /// decoder vector is rebuilt to one loader per result column.
    pub fn set_pgresult(&mut self, result: Option<Arc<dyn PgResult>>) -> Result<(), Error> {
        let Some(res) = result else {
            self.result = None;
            self.nfields = 0;
            self.ntuples = 0;
            self.row_loaders.clear();
            return Ok(());
        };

        let nfields = res.nfields();
        let mut types = Vec::with_capacity(nfields);
        let mut formats = Vec::with_capacity(nfields);
        let mut fmods = Vec::with_capacity(nfields);
        for col in 0..nfields {
            types.push(res.ftype(col));
            formats.push(res.fformat(col));
            fmods.push(res.fmod(col));
        }
        self.nfields = nfields;
        self.ntuples = res.ntuples();
        self.result = Some(res);
        self.set_row_types(&types, &formats, &fmods)
    }

    /// Configure the row decoders directly, independent of any result;
    /// recursive composite decoding uses this. An empty `fmods` means
    /// all-absent.
    pub fn set_row_types(
        &mut self,
        types: &[Oid],
        formats: &[Format],
        fmods: &[i32],
    ) -> Result<(), Error> {
        if formats.len() != types.len() {
            return Err(Error::Internal(format!(
                "{} row types but {} formats",
                types.len(),
                formats.len()
            )));
        }
        let mut loaders = Vec::with_capacity(types.len());
        for (i, &oid) in types.iter().enumerate() {
            let fmod = fmods.get(i).copied().unwrap_or(-1);
            loaders.push(self.get_loader(oid, formats[i], fmod)?);
        }
        self.row_loaders = loaders;
        Ok(())
    }

    /// Resolve the dumper for `value` in `format`.
    ///
    /// The walk is scope-major, lineage-minor: every scope is probed
    /// for the concrete type and then its ancestors before the next,
    /// more general scope is consulted. Type keys resolve first; the
    /// name-key pass covers forward references and installs a type-key
    /// alias in the hit scope so the next query resolves in one probe.
    pub fn get_dumper(
        &mut self,
        value: &dyn Adaptable,
        format: Format,
    ) -> Result<Arc<dyn Dump>, Error> {
        let concrete = value.tag();
        let cache_key = (concrete.id, format);
        if let Some(dumper) = self.dumpers_cache.get(&cache_key) {
            return Ok(dumper.clone());
        }

        let lineage = value.lineage();
        let Some((factory, tag)) = self.find_dumper_factory(&lineage, format) else {
            return Err(Error::Programming(format!(
                "cannot adapt type {} to format {}",
                concrete.name, format
            )));
        };
        let dumper = (*factory)(&tag, self);
        self.dumpers_cache.insert(cache_key, dumper.clone());
        Ok(dumper)
    }

    fn find_dumper_factory(
        &self,
        lineage: &[TypeTag],
        format: Format,
    ) -> Option<(DumperFactory, TypeTag)> {
        for scope in &self.scopes {
            let map = scope.read();
            for tag in lineage {
                if let Some(factory) = map.dumper(&(DumperKey::Type(tag.id), format)) {
                    return Some((factory.clone(), *tag));
                }
            }
        }

        for scope in &self.scopes {
            let mut hit = None;
            {
                let map = scope.read();
                for tag in lineage {
                    if let Some(factory) = map.dumper(&(DumperKey::Name(tag.name.to_owned()), format))
                    {
                        hit = Some((factory.clone(), *tag));
                        break;
                    }
                }
            }
            if let Some((factory, tag)) = hit {
                scope
                    .write()
                    .insert_dumper(DumperKey::Type(tag.id), format, factory.clone());
                return Some((factory, tag));
            }
        }

        None
    }

    /// Resolve the loader for a column, falling back to the unknown-type
    /// passthrough registered under the invalid oid.
    pub fn get_loader(&mut self, oid: Oid, format: Format, fmod: i32) -> Result<Arc<dyn Load>, Error> {
        let cache_key = (oid, format, fmod);
        if let Some(loader) = self.loaders_cache.get(&cache_key) {
            return Ok(loader.clone());
        }

        let mut factory = None;
        for scope in &self.scopes {
            if let Some(found) = scope.read().loader(&(oid, format)) {
                factory = Some(found.clone());
                break;
            }
        }
        if factory.is_none() {
            for scope in &self.scopes {
                if let Some(found) = scope.read().loader(&(oids::INVALID, format)) {
                    factory = Some(found.clone());
                    break;
                }
            }
        }
        let factory = factory.ok_or_else(|| {
            Error::Programming(format!("cannot load oid {oid} in format {format}"))
        })?;
        let loader = (*factory)(oid, fmod, self);
        self.loaders_cache.insert(cache_key, loader.clone());
        Ok(loader)
    }

    /// Decode row `row` of the attached result; `None` without a result
    /// or past the last row. Null cells pass through without touching
    /// their loader.
    pub fn load_row(&self, row: usize) -> Result<Option<Row>, Error> {
        let Some(res) = self.result.as_ref() else {
            return Ok(None);
        };
        if row >= self.ntuples {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.nfields);
        for col in 0..self.nfields {
            values.push(match res.get_value(row, col) {
                Some(raw) => Some(self.row_loaders[col].load(raw)?),
                None => None,
            });
        }
        Ok(Some(Row(values)))
    }

    /// Decode one already-extracted record through the configured row
    /// decoders (recursive composite decode).
    pub fn load_sequence(&self, record: &[Option<&[u8]>]) -> Result<Row, Error> {
        if record.len() != self.row_loaders.len() {
            return Err(Error::Internal(format!(
                "record has {} fields, {} decoders configured",
                record.len(),
                self.row_loaders.len()
            )));
        }
        let mut values = Vec::with_capacity(record.len());
        for (cell, loader) in record.iter().zip(&self.row_loaders) {
            values.push(match cell {
                Some(raw) => Some(loader.load(raw)?),
                None => None,
            });
        }
        Ok(Row(values))
    }
}

impl AdaptContext for Transformer {
    fn scope_chain(&self) -> Vec<ScopeMap> {
        self.scopes.clone()
    }

    fn local_scope(&self) -> ScopeMap {
        self.scopes[0].clone()
    }

    fn chain_is_complete(&self) -> bool {
        true
    }

    fn escaping(&self) -> Option<Arc<dyn Escaping>> {
        self.escaping.clone()
    }
}
