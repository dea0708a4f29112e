//! Builtin type oids from the server catalog.

use crate::pq::Oid;

/// Sentinel for an unknown type; the fallback passthrough loaders are
/// registered under it.
pub const INVALID: Oid = 0;

pub const BOOL: Oid = 16;
pub const BYTEA: Oid = 17;
pub const NAME: Oid = 19;
pub const INT8: Oid = 20;
pub const INT2: Oid = 21;
pub const INT4: Oid = 23;
pub const TEXT: Oid = 25;
pub const OID: Oid = 26;
pub const FLOAT8: Oid = 701;
pub const VARCHAR: Oid = 1043;
pub const RECORD: Oid = 2249;
