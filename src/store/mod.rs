//! Persistence layer: libSQL-backed checkpoints, dedup hashes, credential
//! health and link-check records.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Checkpoint, CredentialHealth, CredentialStatus, LinkRecord, LinkStatus, Store};
