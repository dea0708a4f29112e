//! Nonblocking core of a PostgreSQL client driver.
//!
//! Two tightly coupled subsystems live here: suspendable connect and
//! execute-drain state machines driven to completion by interchangeable
//! waiters ([`waiting`]), and a scope-chained adaptation engine
//! resolving a dumper per outgoing value and a loader per result column
//! ([`adapt`]). The wire protocol itself belongs to the native client
//! behind the [`pq`] traits.

pub mod adapt;
pub mod connection;
pub mod errors;
pub mod pq;
pub mod types;
pub mod waiting;

pub use adapt::{AdaptContext, Adaptable, Dump, Escaping, HostValue, Load, Transformer};
pub use connection::{AsyncConnection, Connection, Cursor};
pub use errors::Error;
pub use pq::{Format, Oid};
