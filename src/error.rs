//! Error types for feed-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Credential pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Link check error: {0}")]
    LinkCheck(#[from] LinkCheckError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A checkpoint write that does not move forward. Never expected in
    /// correct operation; the write is refused.
    #[error("Stale checkpoint for source {source_id}: attempted {attempted}, current {current}")]
    StaleCheckpoint {
        source_id: i64,
        current: i64,
        attempted: i64,
    },
}

/// Transport-level errors outside of a send attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed for credential {credential}: {reason}")]
    ConnectFailed { credential: String, reason: String },

    #[error("Authentication failed for credential {credential}: {reason}")]
    AuthFailed { credential: String, reason: String },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Operation not supported by transport: {0}")]
    Unsupported(String),

    #[error("Rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Outcome of a failed send attempt, classified for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The credential must rest for `wait` before sending again.
    #[error("Rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },

    /// Network hiccup or server-side failure; worth retrying.
    #[error("Transient transport error: {0}")]
    Transient(String),

    /// The destination chat or sub-thread no longer exists or refuses us.
    #[error("Destination gone: {0}")]
    DestinationGone(String),

    /// The source disallows forwarding; copy mode is required.
    #[error("Forwarding restricted by source")]
    ForwardRestricted,

    /// The credential was rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

/// Identifier resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Unresolvable reference '{reference}': {reason}")]
    UnresolvableReference { reference: String, reason: String },
}

/// Credential pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No credential available")]
    NoneAvailable {
        /// Earliest moment a rate-limited credential frees up.
        retry_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    #[error("Unknown credential: {0}")]
    UnknownCredential(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Dispatcher errors surfaced to callers of `run`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No credential could connect")]
    NoSessions,

    #[error("Dispatcher is already running")]
    AlreadyRunning,

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Link checker errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkCheckError {
    #[error("Link checker is disabled")]
    Disabled,

    #[error("No session available for link checking")]
    NoSession,

    #[error("Invalid link check schedule: {0}")]
    InvalidSchedule(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
