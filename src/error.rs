//! Error types for the Tollgate service.

use thiserror::Error;

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The operation's cancellation token fired before it completed
    #[error("storage operation cancelled")]
    Cancelled,

    /// The operation's deadline passed before it completed
    #[error("storage operation deadline exceeded")]
    DeadlineExceeded,

    /// The backend could not be reached or rejected the connection
    #[error("connection error: {0}")]
    Connection(String),

    /// Redis command errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Memcached command errors
    #[error("memcached error: {0}")]
    Memcached(#[from] memcache::MemcacheError),

    /// Relational database errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be interpreted
    #[error("corrupt value for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// A blocking backend call panicked or was aborted
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage errors outside of a rate limit check (startup, shutdown)
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The ban lookup for a check failed
    #[error("failed to check ban status: {0}")]
    BanLookup(#[source] StorageError),

    /// The window counter increment for a check failed
    #[error("failed to increment rate counter: {0}")]
    Increment(#[source] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
