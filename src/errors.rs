//! Errors.

use std::io;

/// Driver errors, grouped by the severity the caller sees.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database, or the connection to it, is unusable: a failed
    /// connect, a connection marked bad, an unexpected commit/rollback
    /// reply.
    #[error("operational error: {0}")]
    Operational(String),
    /// The native client reported something the driver does not know how
    /// to handle.
    #[error("internal error: {0}")]
    Internal(String),
    /// The adaptation registry cannot resolve a codec for a value.
    #[error("programming error: {0}")]
    Programming(String),
    /// A codec was registered under the wrong kind of key.
    #[error("registration error: {0}")]
    Registration(String),
    /// A wire value does not parse as its declared type.
    #[error("data error: {0}")]
    Data(String),
    /// The waiter deadline expired. The facade marks the connection bad
    /// before surfacing this.
    #[error("timeout expired")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}
