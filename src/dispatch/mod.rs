//! Delivery coordination: per-source workers, credential rotation and
//! the counters behind status reports.

pub mod dispatcher;
pub mod pool;
pub mod state;
pub mod stats;

pub use dispatcher::Dispatcher;
pub use pool::{CredentialPool, Lease};
pub use stats::DispatchStats;
