//! ovs-idl: OVSDB client session with a replicated table cache
//!
//! This crate provides:
//! - RFC 7047 JSON-RPC framing over Unix sockets and TCP
//! - Schema parsing and per-column registration
//! - A monitored replica with a change-sequence number
//! - Optimistic transactions with verify-before-write
//! - An in-memory OVSDB server for tests and local tooling

pub mod datum;
pub mod error;
pub mod idl;
pub mod memdb;
pub mod protocol;
pub mod replica;
pub mod schema;
pub mod transaction;

pub use datum::{Atom, Datum};
pub use error::{IdlError, Result};
pub use idl::{Idl, IdlOptions, Remote};
pub use memdb::MemoryServer;
pub use replica::{Replica, Row, Table};
pub use schema::{DatabaseSchema, SchemaHelper};
pub use transaction::{Transaction, TxnStatus};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::datum::{Atom, Datum};
    pub use super::idl::{Idl, IdlOptions};
    pub use super::schema::SchemaHelper;
    pub use super::transaction::{Transaction, TxnStatus};
}
