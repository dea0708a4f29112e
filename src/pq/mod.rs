//! Contract of the native wire-protocol client.
//!
//! The driver does not frame PostgreSQL messages itself; it drives a
//! lower-level nonblocking client through the traits below and never
//! touches the socket other than to wait for readiness on its
//! descriptor. A scripted implementation for tests lives in `mock`.

mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use types::{ConnStatus, ExecStatus, Format, PollingStatus, TransactionStatus};

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::errors::Error;

/// Identifier of a type in the server catalog.
pub type Oid = u32;

/// Wire connection handle: one socket, one native client state,
/// exclusively owned by its connection facade.
pub trait PgConn: Send {
    /// Begin an asynchronous connection attempt.
    fn connect_start(conninfo: &str) -> Result<Self, Error>
    where
        Self: Sized;

    /// Advance the connect handshake after readiness fired.
    fn connect_poll(&mut self) -> PollingStatus;

    fn status(&self) -> ConnStatus;

    fn transaction_status(&self) -> TransactionStatus;

    /// Descriptor the waiters poll.
    fn socket(&self) -> RawFd;

    /// Switch the socket to nonblocking mode. Called exactly once, right
    /// after the connect machine sees [`PollingStatus::Ok`].
    fn set_nonblocking(&mut self, enabled: bool) -> Result<(), Error>;

    /// Human-readable description of the last error on this connection.
    fn error_message(&self) -> String;

    /// Queue a simple query for nonblocking dispatch.
    fn send_query(&mut self, query: &[u8]) -> Result<(), Error>;

    /// Queue a parameterized query. `None` parameters are SQL nulls.
    /// Empty `param_types` lets the server infer; empty `param_formats`
    /// means all-text.
    fn send_query_params(
        &mut self,
        query: &[u8],
        params: &[Option<&[u8]>],
        param_types: &[Oid],
        param_formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error>;

    /// Push buffered outbound bytes: 0 means done, >0 means more to
    /// write. The native "<0 means error" return surfaces as `Err`.
    fn flush(&mut self) -> Result<i32, Error>;

    /// Read whatever inbound bytes the socket holds, without blocking.
    fn consume_input(&mut self) -> Result<(), Error>;

    /// Would `get_result` block?
    fn is_busy(&self) -> bool;

    /// Next queued result, or `None` once the current query is drained.
    fn get_result(&mut self) -> Option<Arc<dyn PgResult>>;

    /// Record that the connection is unusable (waiter timeout, abandoned
    /// I/O machine).
    fn mark_bad(&mut self);

    /// Escape a value as a complete SQL literal, honoring the connection
    /// encoding and standard-conforming-strings.
    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error>;

    /// Escape a value for embedding between single quotes.
    fn escape_string(&self, value: &[u8]) -> Vec<u8>;
}

impl std::fmt::Debug for dyn PgResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn PgResult>")
    }
}

/// One server reply, immutable after production.
pub trait PgResult: Send + Sync {
    fn status(&self) -> ExecStatus;

    /// Number of result columns.
    fn nfields(&self) -> usize;

    /// Number of rows.
    fn ntuples(&self) -> usize;

    /// Type oid of column `col`.
    fn ftype(&self, col: usize) -> Oid;

    /// Wire format of column `col`.
    fn fformat(&self, col: usize) -> Format;

    /// Type modifier of column `col`, -1 when absent.
    fn fmod(&self, col: usize) -> i32;

    /// Raw bytes of one cell; `None` is SQL null.
    fn get_value(&self, row: usize, col: usize) -> Option<&[u8]>;

    fn error_message(&self) -> String;
}
