//! Builtin scalar codecs: just enough to bootstrap the engine.
//!
//! Loaders parse the text representation the server sends; dumpers
//! produce the text representation the server parses. Richer type
//! support registers its own codecs through [`crate::adapt`].

use std::any::TypeId;
use std::sync::Arc;

use crate::adapt::{
    downcast_value, Adaptable, AdapterMap, Dump, DumperKey, Escaping, HostValue, Load, Transformer,
    TypeTag,
};
use crate::errors::Error;
use crate::pq::{Format, Oid};

use super::composite::{RecordBinaryLoader, RecordTextLoader, TupleDumper};
use super::{oids, utf8, Record};

// ---------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------

/// `text`-family columns as `String`.
pub(crate) struct TextLoader {
    oid: Oid,
    fmod: i32,
}

impl Load for TextLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        Ok(Box::new(utf8(data)?.to_owned()))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

fn text_loader(oid: Oid, fmod: i32, _tx: &Transformer) -> Arc<dyn Load> {
    Arc::new(TextLoader { oid, fmod })
}

pub(crate) struct BoolLoader {
    oid: Oid,
    fmod: i32,
}

impl Load for BoolLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        match data {
            b"t" => Ok(Box::new(true)),
            b"f" => Ok(Box::new(false)),
            _ => Err(Error::Data(format!(
                "invalid bool literal: {:?}",
                String::from_utf8_lossy(data)
            ))),
        }
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

fn bool_loader(oid: Oid, fmod: i32, _tx: &Transformer) -> Arc<dyn Load> {
    Arc::new(BoolLoader { oid, fmod })
}

macro_rules! number_text_loader {
    ($loader:ident, $factory:ident, $ty:ty) => {
        pub(crate) struct $loader {
            oid: Oid,
            fmod: i32,
        }

        impl Load for $loader {
            fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
                let s = utf8(data)?;
                let value: $ty = s.trim().parse().map_err(|_| {
                    Error::Data(format!(
                        "invalid {} literal: {s:?}",
                        stringify!($ty)
                    ))
                })?;
                Ok(Box::new(value))
            }

            fn oid(&self) -> Oid {
                self.oid
            }

            fn fmod(&self) -> i32 {
                self.fmod
            }
        }

        fn $factory(oid: Oid, fmod: i32, _tx: &Transformer) -> Arc<dyn Load> {
            Arc::new($loader { oid, fmod })
        }
    };
}

number_text_loader!(Int2Loader, int2_loader, i16);
number_text_loader!(Int4Loader, int4_loader, i32);
number_text_loader!(Int8Loader, int8_loader, i64);
number_text_loader!(OidLoader, oid_loader, u32);
number_text_loader!(Float8Loader, float8_loader, f64);

/// Unknown oid in text format: keep the bytes as a (lossy) `String`.
pub(crate) struct UnknownTextLoader {
    oid: Oid,
    fmod: i32,
}

impl Load for UnknownTextLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        Ok(Box::new(String::from_utf8_lossy(data).into_owned()))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

fn unknown_text_loader(oid: Oid, fmod: i32, _tx: &Transformer) -> Arc<dyn Load> {
    Arc::new(UnknownTextLoader { oid, fmod })
}

/// Unknown oid in binary format: hand the raw bytes through.
pub(crate) struct UnknownBinaryLoader {
    oid: Oid,
    fmod: i32,
}

impl Load for UnknownBinaryLoader {
    fn load(&self, data: &[u8]) -> Result<HostValue, Error> {
        Ok(Box::new(data.to_vec()))
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn fmod(&self) -> i32 {
        self.fmod
    }
}

fn unknown_binary_loader(oid: Oid, fmod: i32, _tx: &Transformer) -> Arc<dyn Load> {
    Arc::new(UnknownBinaryLoader { oid, fmod })
}

fn record_text_loader(oid: Oid, fmod: i32, tx: &Transformer) -> Arc<dyn Load> {
    Arc::new(RecordTextLoader::new(oid, fmod, tx))
}

fn record_binary_loader(oid: Oid, fmod: i32, tx: &Transformer) -> Arc<dyn Load> {
    Arc::new(RecordBinaryLoader::new(oid, fmod, tx))
}

// ---------------------------------------------------------------------
// Dumpers
// ---------------------------------------------------------------------

pub(crate) struct StringDumper {
    escaping: Option<Arc<dyn Escaping>>,
}

impl Dump for StringDumper {
    fn dump(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error> {
        Ok(downcast_value::<String>(value, "string")?.as_bytes().to_vec())
    }

    fn escaping(&self) -> Option<&Arc<dyn Escaping>> {
        self.escaping.as_ref()
    }

    fn oid(&self) -> Oid {
        oids::TEXT
    }
}

fn string_dumper(_tag: &TypeTag, tx: &Transformer) -> Arc<dyn Dump> {
    Arc::new(StringDumper {
        escaping: tx.escaping(),
    })
}

pub(crate) struct BoolDumper {
    escaping: Option<Arc<dyn Escaping>>,
}

impl Dump for BoolDumper {
    fn dump(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error> {
        let value = downcast_value::<bool>(value, "bool")?;
        Ok(if *value { b"t".to_vec() } else { b"f".to_vec() })
    }

    fn escaping(&self) -> Option<&Arc<dyn Escaping>> {
        self.escaping.as_ref()
    }

    fn oid(&self) -> Oid {
        oids::BOOL
    }
}

fn bool_dumper(_tag: &TypeTag, tx: &Transformer) -> Arc<dyn Dump> {
    Arc::new(BoolDumper {
        escaping: tx.escaping(),
    })
}

macro_rules! number_text_dumper {
    ($dumper:ident, $factory:ident, $ty:ty, $oid:expr) => {
        pub(crate) struct $dumper {
            escaping: Option<Arc<dyn Escaping>>,
        }

        impl Dump for $dumper {
            fn dump(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error> {
                let value = downcast_value::<$ty>(value, stringify!($ty))?;
                Ok(value.to_string().into_bytes())
            }

            fn escaping(&self) -> Option<&Arc<dyn Escaping>> {
                self.escaping.as_ref()
            }

            fn oid(&self) -> Oid {
                $oid
            }
        }

        fn $factory(_tag: &TypeTag, tx: &Transformer) -> Arc<dyn Dump> {
            Arc::new($dumper {
                escaping: tx.escaping(),
            })
        }
    };
}

number_text_dumper!(Int2Dumper, int2_dumper, i16, oids::INT2);
number_text_dumper!(Int4Dumper, int4_dumper, i32, oids::INT4);
number_text_dumper!(Int8Dumper, int8_dumper, i64, oids::INT8);
number_text_dumper!(Float8Dumper, float8_dumper, f64, oids::FLOAT8);

/// Bytes in the hex form the server accepts for `bytea` text input.
pub(crate) struct ByteaDumper {
    escaping: Option<Arc<dyn Escaping>>,
}

impl Dump for ByteaDumper {
    fn dump(&self, value: &dyn Adaptable) -> Result<Vec<u8>, Error> {
        let value = downcast_value::<Vec<u8>>(value, "bytea")?;
        let mut out = Vec::with_capacity(2 + value.len() * 2);
        out.extend_from_slice(b"\\x");
        for &b in value {
            out.extend_from_slice(format!("{b:02x}").as_bytes());
        }
        Ok(out)
    }

    fn escaping(&self) -> Option<&Arc<dyn Escaping>> {
        self.escaping.as_ref()
    }

    fn oid(&self) -> Oid {
        oids::BYTEA
    }
}

fn bytea_dumper(_tag: &TypeTag, tx: &Transformer) -> Arc<dyn Dump> {
    Arc::new(ByteaDumper {
        escaping: tx.escaping(),
    })
}

fn tuple_dumper(_tag: &TypeTag, tx: &Transformer) -> Arc<dyn Dump> {
    Arc::new(TupleDumper::new(tx))
}

// ---------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------

/// Populate the process-global registry. Called once, on first touch of
/// the global scope.
pub(crate) fn register_builtins(map: &mut AdapterMap) {
    map.insert_loader(oids::INVALID, Format::Text, Arc::new(unknown_text_loader));
    map.insert_loader(oids::INVALID, Format::Binary, Arc::new(unknown_binary_loader));

    map.insert_loader(oids::TEXT, Format::Text, Arc::new(text_loader));
    map.insert_loader(oids::NAME, Format::Text, Arc::new(text_loader));
    map.insert_loader(oids::VARCHAR, Format::Text, Arc::new(text_loader));
    map.insert_loader(oids::BOOL, Format::Text, Arc::new(bool_loader));
    map.insert_loader(oids::INT2, Format::Text, Arc::new(int2_loader));
    map.insert_loader(oids::INT4, Format::Text, Arc::new(int4_loader));
    map.insert_loader(oids::INT8, Format::Text, Arc::new(int8_loader));
    map.insert_loader(oids::OID, Format::Text, Arc::new(oid_loader));
    map.insert_loader(oids::FLOAT8, Format::Text, Arc::new(float8_loader));
    map.insert_loader(oids::RECORD, Format::Text, Arc::new(record_text_loader));
    map.insert_loader(oids::RECORD, Format::Binary, Arc::new(record_binary_loader));

    map.insert_dumper(
        DumperKey::Type(TypeId::of::<String>()),
        Format::Text,
        Arc::new(string_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<bool>()),
        Format::Text,
        Arc::new(bool_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<i16>()),
        Format::Text,
        Arc::new(int2_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<i32>()),
        Format::Text,
        Arc::new(int4_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<i64>()),
        Format::Text,
        Arc::new(int8_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<f64>()),
        Format::Text,
        Arc::new(float8_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<Vec<u8>>()),
        Format::Text,
        Arc::new(bytea_dumper),
    );
    map.insert_dumper(
        DumperKey::Type(TypeId::of::<Record>()),
        Format::Text,
        Arc::new(tuple_dumper),
    );
}
