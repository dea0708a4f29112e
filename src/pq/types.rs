//! Status enumerations mirrored from the native client.

use std::fmt;

/// Connection status as reported by the native client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
    Started,
    Made,
    AwaitingResponse,
    AuthOk,
    SslStartup,
    Needed,
}

/// Verdict of one nonblocking connect poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    Failed,
    Reading,
    Writing,
    Ok,
    /// Obsolete verdict some clients still report; the connect machine
    /// treats it as unexpected.
    Active,
}

/// Server-side transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Connected, no transaction open.
    Idle,
    /// A command is in progress.
    Active,
    /// Inside an open transaction block.
    InTrans,
    /// Inside a failed transaction block.
    InError,
    Unknown,
}

/// Status of one result handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    CopyOut,
    CopyIn,
    CopyBoth,
    BadResponse,
    NonfatalError,
    FatalError,
    SingleTuple,
}

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Text,
    Binary,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Format::Text => "TEXT",
            Format::Binary => "BINARY",
        })
    }
}
