//! Record and composite type adaptation.
//!
//! These codecs exercise the transformer recursively: every field of a
//! record is decoded (or dumped) through a nested transformer that
//! shares the parent's scope maps, so a registration made anywhere in
//! the chain is visible to nested decodes without re-probing.

use std::sync::Arc;

use bytes::Buf;
use parking_lot::Mutex;

use crate::adapt::{
    self, downcast_value, AdaptContext, Adaptable, Dump, Escaping, HostValue, Load, Transformer,
};
use crate::connection::{AsyncConnection, Connection};
use crate::errors::Error;
use crate::pq::{ExecStatus, Format, Oid, PgConn, PgResult};

use super::{oids, utf8, Composite, Record, Row};

/// Field catalog entry of a composite type.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub type_oid: Oid,
}

/// Catalog description of a composite type.
#[derive(Debug, Clone)]
pub struct CompositeInfo {
    pub name: String,
    pub oid: Oid,
    pub array_oid: Oid,
    pub fields: Vec<FieldInfo>,
}

/// Constructor applied to the decoded fields of a composite value.
pub type CompositeFactory = Arc<dyn Fn(Vec<Option<HostValue>>) -> HostValue + Send + Sync>;

// ---------------------------------------------------------------------
// Text record format: (a,b,"c,d",,e)
// ---------------------------------------------------------------------

/// Split a text record literal into raw fields, `None` for the empty
/// (null) slots.
fn parse_record(data: &[u8]) -> Result<Vec<Option<Vec<u8>>>, Error> {
    if data == b"()" {
        return Ok(Vec::new());
    }
    if data.len() < 2 || data[0] != b'(' || data[data.len() - 1] != b')' {
        return Err(malformed(data));
    }

    let mut fields = Vec::new();
    let mut i = 1;
    loop {
        let (value, end) = match data.get(i) {
            None => return Err(malformed(data)),
            Some(b',') | Some(b')') => (None, i),
            Some(b'"') => {
                let (value, end) = parse_quoted(data, i + 1)?;
                (Some(value), end)
            }
            Some(_) => {
                let mut j = i;
                while j < data.len() && data[j] != b',' && data[j] != b')' {
                    if data[j] == b'"' {
                        return Err(malformed(data));
                    }
                    j += 1;
                }
                (Some(data[i..j].to_vec()), j)
            }
        };
        fields.push(value);
        match data.get(end) {
            Some(b',') => i = end + 1,
            Some(b')') if end == data.len() - 1 => return Ok(fields),
            _ => return Err(malformed(data)),
        }
    }
}

/// Scan a quoted field starting just past the opening quote, un-doubling
/// `""` and `\\` as it goes. Returns the value and the index just past
/// the closing quote.
fn parse_quoted(data: &[u8], mut i: usize) -> Result<(Vec<u8>, usize), Error> {
    let mut out = Vec::new();
    while i < data.len() {
        match data[i] {
            b'"' => {
                if data.get(i + 1) == Some(&b'"') {
                    out.push(b'"');
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            }
            b'\\' => {
                if data.get(i + 1) == Some(&b'\\') {
                    out.push(b'\\');
                    i += 2;
                } else {
                    out.push(b'\\');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(Error::Data("unterminated quoted field in record literal".into()))
}

fn malformed(data: &[u8]) -> Error {
    Error::Data(format!(
        "malformed record literal: {:?}",
        String::from_utf8_lossy(data)
    ))
}

/// `record` in text format: every field passes through the `text`
/// loader, the result is a positional [`Row`].
pub struct RecordTextLoader {
    oid: Oid,
    fmod: i32,
    tx: Mutex<Transformer>,
}

impl RecordTextLoader {
    pub(crate) fn new(oid: Oid, fmod: i32, context: &Transformer) -> RecordTextLoader {
        RecordTextLoader {
            oid,
            fmod,
            tx: Mutex::new(Transformer::new(Some(context))),
        }
    }
}

impl Load for RecordTextLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        let fields = parse_record(data)?;
        let mut tx = self.tx.lock();
        let text = tx.get_loader(oids::TEXT, Format::Text, -1)?;
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            values.push(match field {
                Some(raw) => Some(text.load(&raw)?),
                None => None,
            });
        }
        Ok(Box::new(Row(values)))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

// ---------------------------------------------------------------------
// Binary record format
// ---------------------------------------------------------------------

/// Walk a binary record payload: 4-byte signed field count, then per
/// field a 4-byte oid, a 4-byte signed length (-1 for null) and the
/// payload. Returns `(oid, span-into-data)` per field.
#[allow(clippy::type_complexity)]
fn walk_record(data: &[u8]) -> Result<Vec<(Oid, Option<(usize, usize)>)>, Error> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return Err(Error::Data("truncated binary record header".into()));
    }
    let nfields = buf.get_i32();
    if nfields < 0 {
        return Err(Error::Data(format!("binary record with {nfields} fields")));
    }
    let mut fields = Vec::with_capacity(nfields as usize);
    let mut offset = 4usize;
    for _ in 0..nfields {
        if buf.remaining() < 8 {
            return Err(Error::Data("truncated binary record field header".into()));
        }
        let oid = buf.get_u32();
        let len = buf.get_i32();
        offset += 8;
        if len == -1 {
            fields.push((oid, None));
            continue;
        }
        if len < 0 {
            return Err(Error::Data(format!("binary record field length {len}")));
        }
        let len = len as usize;
        if buf.remaining() < len {
            return Err(Error::Data("truncated binary record field".into()));
        }
        fields.push((oid, Some((offset, len))));
        buf.advance(len);
        offset += len;
    }
    Ok(fields)
}

struct ConfiguredTx {
    tx: Transformer,
    configured: bool,
}

impl ConfiguredTx {
    fn new(context: &Transformer) -> Mutex<ConfiguredTx> {
        Mutex::new(ConfiguredTx {
            tx: Transformer::new(Some(context)),
            configured: false,
        })
    }
}

/// `record` in binary format. The oids scanned from the first record
/// configure the inner transformer; later records reuse that row-type
/// configuration.
pub struct RecordBinaryLoader {
    oid: Oid,
    fmod: i32,
    inner: Mutex<ConfiguredTx>,
}

impl RecordBinaryLoader {
    pub(crate) fn new(oid: Oid, fmod: i32, context: &Transformer) -> RecordBinaryLoader {
        RecordBinaryLoader {
            oid,
            fmod,
            inner: ConfiguredTx::new(context),
        }
    }
}

fn load_binary_record(inner: &mut ConfiguredTx, data: &[u8]) -> Result<Row, Error> {
    let fields = walk_record(data)?;
    if !inner.configured {
        let types: Vec<Oid> = fields.iter().map(|f| f.0).collect();
        let formats = vec![Format::Binary; types.len()];
        inner.tx.set_row_types(&types, &formats, &[])?;
        inner.configured = true;
    }
    let cells: Vec<Option<&[u8]>> = fields
        .iter()
        .map(|(_, span)| span.map(|(off, len)| &data[off..off + len]))
        .collect();
    inner.tx.load_sequence(&cells)
}

impl Load for RecordBinaryLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        let mut inner = self.inner.lock();
        Ok(Box::new(load_binary_record(&mut inner, data)?))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

// ---------------------------------------------------------------------
// Named composites
// ---------------------------------------------------------------------

/// A named composite in text format: record decode plus the registered
/// factory, with the field types known from the catalog up front.
pub struct CompositeTextLoader {
    oid: Oid,
    fmod: i32,
    factory: CompositeFactory,
    fields_types: Arc<[Oid]>,
    inner: Mutex<ConfiguredTx>,
}

impl CompositeTextLoader {
    pub(crate) fn new(
        oid: Oid,
        fmod: i32,
        factory: CompositeFactory,
        fields_types: Arc<[Oid]>,
        context: &Transformer,
    ) -> CompositeTextLoader {
        CompositeTextLoader {
            oid,
            fmod,
            factory,
            fields_types,
            inner: ConfiguredTx::new(context),
        }
    }
}

impl Load for CompositeTextLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        let fields = parse_record(data)?;
        let mut inner = self.inner.lock();
        if !inner.configured {
            let formats = vec![Format::Text; self.fields_types.len()];
            inner.tx.set_row_types(&self.fields_types, &formats, &[])?;
            inner.configured = true;
        }
        let cells: Vec<Option<&[u8]>> = fields.iter().map(|f| f.as_deref()).collect();
        let Row(values) = inner.tx.load_sequence(&cells)?;
        Ok((*self.factory)(values))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

/// A named composite in binary format: binary record decode plus the
/// registered factory.
pub struct CompositeBinaryLoader {
    oid: Oid,
    fmod: i32,
    factory: CompositeFactory,
    inner: Mutex<ConfiguredTx>,
}

impl CompositeBinaryLoader {
    pub(crate) fn new(
        oid: Oid,
        fmod: i32,
        factory: CompositeFactory,
        context: &Transformer,
    ) -> CompositeBinaryLoader {
        CompositeBinaryLoader {
            oid,
            fmod,
            factory,
            inner: ConfiguredTx::new(context),
        }
    }
}

impl Load for CompositeBinaryLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        let mut inner = self.inner.lock();
        let Row(values) = load_binary_record(&mut inner, data)?;
        Ok((*self.factory)(values))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

// ---------------------------------------------------------------------
// Tuple dumper
// ---------------------------------------------------------------------

fn needs_quotes(dumped: &[u8]) -> bool {
    dumped.is_empty()
        || dumped.iter().any(|&b| {
            matches!(
                b,
                b'"' | b',' | b'\\' | b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c
            )
        })
}

/// Host tuples ([`Record`]) as text composite literals.
pub struct TupleDumper {
    escaping: Option<Arc<dyn Escaping>>,
    tx: Mutex<Transformer>,
}

impl TupleDumper {
    pub(crate) fn new(context: &Transformer) -> TupleDumper {
        TupleDumper {
            escaping: context.escaping(),
            tx: Mutex::new(Transformer::new(Some(context))),
        }
    }
}

impl Dump for TupleDumper {
    fn dump(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error> {
        let record = downcast_value::<Record>(value, "tuple")?;
        if record.0.is_empty() {
            return Ok(b"()".to_vec());
        }
        let mut tx = self.tx.lock();
        let mut out = vec![b'('];
        for (i, item) in record.0.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            let Some(item) = item else {
                continue; // null: an empty slot
            };
            let dumper = tx.get_dumper(&**item, Format::Text)?;
            let dumped = dumper.dump(&**item)?;
            if needs_quotes(&dumped) {
                out.push(b'"');
                for &b in &dumped {
                    if b == b'"' {
                        out.push(b'"');
                    }
                    out.push(b);
                }
                out.push(b'"');
            } else {
                out.extend_from_slice(&dumped);
            }
        }
        out.push(b')');
        Ok(out)
    }

    fn escaping(&self) -> Option<&Arc<dyn Escaping>> {
        self.escaping.as_ref()
    }

    fn oid(&self) -> Oid {
        oids::RECORD
    }
}

// ---------------------------------------------------------------------
// Catalog probe and registration
// ---------------------------------------------------------------------

/// One probe per composite type; callers keep the returned info around.
pub(crate) const TYPE_INFO_QUERY: &str = "\
select
    t.typname as name, t.oid as oid, t.typarray as array_oid,
    coalesce(a.fnames, '{}') as fnames,
    coalesce(a.ftypes, '{}') as ftypes
from pg_type t
left join (
    select attrelid,
        array_agg(attname) as fnames,
        array_agg(atttypid) as ftypes
    from (
        select a.attrelid, a.attname, a.atttypid
        from pg_attribute a
        join pg_type t on t.typrelid = a.attrelid
        where t.typname = $1
          and a.attnum > 0
          and not a.attisdropped
        order by a.attnum
    ) x
    group by attrelid
) a on a.attrelid = t.typrelid
where t.typname = $1
";

/// Fetch the catalog description of composite type `name`, or `None`
/// when the type does not exist. Results are requested in binary
/// format: the `fnames`/`ftypes` columns then arrive length-prefixed
/// instead of as array literals.
pub fn fetch_info<C: PgConn>(
    conn: &Connection<C>,
    name: &str,
) -> Result<Option<CompositeInfo>, Error> {
    let results = conn.execute_params(
        TYPE_INFO_QUERY,
        &[Some(name.as_bytes())],
        &[oids::TEXT],
        &[Format::Text],
        Format::Binary,
    )?;
    info_from_results(results)
}

/// Cooperative variant of [`fetch_info`].
pub async fn fetch_info_async<C: PgConn>(
    conn: &AsyncConnection<C>,
    name: &str,
) -> Result<Option<CompositeInfo>, Error> {
    let results = conn
        .execute_params(
            TYPE_INFO_QUERY,
            &[Some(name.as_bytes())],
            &[oids::TEXT],
            &[Format::Text],
            Format::Binary,
        )
        .await?;
    info_from_results(results)
}

fn info_from_results(mut results: Vec<Arc<dyn PgResult>>) -> Result<Option<CompositeInfo>, Error> {
    if results.len() != 1 {
        return Err(Error::Operational(format!(
            "catalog probe returned {} results",
            results.len()
        )));
    }
    let res = results.remove(0);
    if res.status() != ExecStatus::TuplesOk {
        return Err(Error::Operational(format!(
            "catalog probe failed: {}",
            res.error_message()
        )));
    }
    if res.ntuples() == 0 {
        return Ok(None);
    }
    if res.nfields() < 5 {
        return Err(Error::Data(format!(
            "catalog probe row has {} columns",
            res.nfields()
        )));
    }
    let cell = |col: usize| -> Result<&[u8], Error> {
        res.get_value(0, col)
            .ok_or_else(|| Error::Data("null column in catalog probe row".into()))
    };

    let name = utf8(cell(0)?)?.to_owned();
    let oid = parse_binary_oid(cell(1)?)?;
    let array_oid = parse_binary_oid(cell(2)?)?;
    let fnames = parse_binary_array(cell(3)?)?
        .iter()
        .map(|n| Ok(utf8(n)?.to_owned()))
        .collect::<Result<Vec<String>, Error>>()?;
    let ftypes = parse_binary_array(cell(4)?)?
        .iter()
        .map(|t| parse_binary_oid(t))
        .collect::<Result<Vec<Oid>, Error>>()?;
    if fnames.len() != ftypes.len() {
        return Err(Error::Data(format!(
            "composite {name:?} reports {} field names but {} field types",
            fnames.len(),
            ftypes.len()
        )));
    }

    let fields = fnames
        .into_iter()
        .zip(ftypes)
        .map(|(name, type_oid)| FieldInfo { name, type_oid })
        .collect();
    Ok(Some(CompositeInfo {
        name,
        oid,
        array_oid,
        fields,
    }))
}

fn parse_binary_oid(data: &[u8]) -> Result<Oid, Error> {
    let mut buf = data;
    if buf.remaining() != 4 {
        return Err(Error::Data(format!(
            "binary oid of {} bytes",
            buf.remaining()
        )));
    }
    Ok(buf.get_u32())
}

/// Big-endian binary array: dimension count, null bitmap flag, element
/// oid, then per dimension a length and lower bound, then
/// length-prefixed elements. The catalog arrays are one-dimensional and
/// null-free; an empty array comes with zero dimensions.
fn parse_binary_array(data: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let mut buf = data;
    if buf.remaining() < 12 {
        return Err(Error::Data("truncated binary array header".into()));
    }
    let ndim = buf.get_i32();
    let _flags = buf.get_i32();
    let _elem_oid = buf.get_u32();
    if ndim == 0 {
        return Ok(Vec::new());
    }
    if ndim != 1 {
        return Err(Error::Data(format!("{ndim}-dimensional catalog array")));
    }
    if buf.remaining() < 8 {
        return Err(Error::Data("truncated binary array dimension".into()));
    }
    let len = buf.get_i32();
    let _lower_bound = buf.get_i32();
    if len < 0 {
        return Err(Error::Data(format!("binary array with {len} elements")));
    }
    let mut elems = Vec::with_capacity(len as usize);
    for _ in 0..len {
        if buf.remaining() < 4 {
            return Err(Error::Data("truncated binary array element header".into()));
        }
        let elen = buf.get_i32();
        if elen < 0 {
            return Err(Error::Data("null element in catalog array".into()));
        }
        let elen = elen as usize;
        if buf.remaining() < elen {
            return Err(Error::Data("truncated binary array element".into()));
        }
        elems.push(buf.copy_to_bytes(elen).to_vec());
    }
    Ok(elems)
}

fn default_factory(info: &CompositeInfo) -> CompositeFactory {
    let type_name = info.name.clone();
    let field_names: Arc<[String]> = info.fields.iter().map(|f| f.name.clone()).collect();
    Arc::new(move |fields: Vec<Option<HostValue>>| -> HostValue {
        Box::new(Composite {
            type_name: type_name.clone(),
            field_names: field_names.clone(),
            fields,
        })
    })
}

/// Install text and binary loaders for composite type `info` into
/// `context`'s scope (the global registry when `None`). `factory`
/// overrides the default [`Composite`] constructor.
pub fn register(
    info: &CompositeInfo,
    context: Option<&dyn AdaptContext>,
    factory: Option<CompositeFactory>,
) -> Result<(), Error> {
    if info.oid == oids::INVALID {
        return Err(Error::Registration(format!(
            "composite type {:?} has no oid",
            info.name
        )));
    }
    let factory = factory.unwrap_or_else(|| default_factory(info));
    let fields_types: Arc<[Oid]> = info.fields.iter().map(|f| f.type_oid).collect();

    let text_factory = {
        let factory = factory.clone();
        let fields_types = fields_types.clone();
        Arc::new(
            move |oid: Oid, fmod: i32, tx: &Transformer| -> Arc<dyn Load> {
                Arc::new(CompositeTextLoader::new(
                    oid,
                    fmod,
                    factory.clone(),
                    fields_types.clone(),
                    tx,
                ))
            },
        )
    };
    adapt::register_loader(info.oid, Format::Text, text_factory, context)?;

    let binary_factory = {
        let factory = factory.clone();
        Arc::new(
            move |oid: Oid, fmod: i32, tx: &Transformer| -> Arc<dyn Load> {
                Arc::new(CompositeBinaryLoader::new(oid, fmod, factory.clone(), tx))
            },
        )
    };
    adapt::register_loader(info.oid, Format::Binary, binary_factory, context)?;

    Ok(())
}
