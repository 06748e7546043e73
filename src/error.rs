use deadpool_redis::redis::RedisError;
use thiserror::Error;

/// Result type for stream and consumer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by user hooks (`on_event`, `init`, ...)
///
/// Hooks are user code, so any error type is accepted.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for the consumer engine and its stream stores
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration. The only fatal error kind.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store unreachable, connection dropped, or not connected yet
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection pool issues
    #[error("Pool error: {0}")]
    Pool(String),

    /// Command rejected by the store (unknown group, wrong type, SQL error, ...)
    #[error("Store error: {0}")]
    Store(String),

    /// Malformed ids, field lists or payloads
    #[error("Validation error: {0}")]
    Validation(String),

    /// The user `init` hook failed
    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl Error {
    /// Whether the error must stop the consumer.
    ///
    /// Everything except configuration errors is absorbed by the
    /// disconnect/reconnect cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Whether the error came from the store connection rather than a command
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Pool(_))
    }
}

/// Convert tokio-postgres errors
impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_error) = err.as_db_error() {
            return Error::Store(format!("{}: {}", db_error.code().code(), db_error.message()));
        }

        // Anything without a database error attached is a transport problem
        Error::Connection(format!("{:?}", err))
    }
}

/// Convert deadpool-postgres pool errors
impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

/// Convert deadpool-postgres build errors
impl From<deadpool_postgres::BuildError> for Error {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        Error::Connection(err.to_string())
    }
}

/// Convert Redis command errors
impl From<RedisError> for Error {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Error::Connection(err.to_string())
        } else {
            Error::Store(err.to_string())
        }
    }
}

/// Convert deadpool-redis pool errors
impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

/// Convert deadpool-redis pool creation errors
impl From<deadpool_redis::CreatePoolError> for Error {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        Error::Connection(err.to_string())
    }
}

/// Convert JSON errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("JSON error: {}", err))
    }
}
