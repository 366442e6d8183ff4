//! Error taxonomy for the process supervisor.
//!
//! Each concern (config, logs, metrics, ipc, supervisor) gets its own
//! `thiserror` enum; [`ProcessManagerError`] composes them with `#[from]` so
//! call sites can use `?` across module boundaries while still preserving
//! the originating variant.
use thiserror::Error;

/// Top-level error type returned by daemon-facing operations.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Identifier (config id, instance id, or name) does not match any
    /// known process.
    #[error("{0} not found")]
    NotFound(String),

    /// A `start` was issued for an id that is already present in the table.
    #[error("process '{0}' already exists")]
    AlreadyExists(String),

    /// Config failed validation; carries every collected issue.
    #[error("validation failed: {}", .0.join("; "))]
    ValidationError(Vec<String>),

    /// The child process could not be spawned.
    #[error("failed to spawn '{service}': {source}")]
    SpawnError {
        /// Name of the process that failed to start.
        service: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// `autorestart` exhausted `maxRestarts`; the instance is now `errored`.
    #[error("policy exhausted for '{0}': max restarts reached")]
    PolicyExhausted(String),

    /// IPC framing or connection I/O failure.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Config file I/O or JSON parse failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Log manager failure.
    #[error(transparent)]
    Logs(#[from] LogsError),

    /// A lock was poisoned by a panicking holder.
    #[error("internal lock poisoned: {0}")]
    MutexPoisonError(String),

    /// A bug, not a user-facing condition. The daemon logs it and stays up.
    #[error("internal error: {0}")]
    Internal(String),
}

impl<T> From<std::sync::PoisonError<T>> for ProcessManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessManagerError::MutexPoisonError(err.to_string())
    }
}

impl From<crate::ipc::IpcError> for ProcessManagerError {
    fn from(err: crate::ipc::IpcError) -> Self {
        ProcessManagerError::TransportError(err.to_string())
    }
}

/// Errors raised while loading or saving an ecosystem file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The ecosystem file does not exist at the given path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The file exists but is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// I/O failure reading or writing the file.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the log manager.
#[derive(Debug, Error)]
pub enum LogsError {
    /// Unknown instance id.
    #[error("{0} not found")]
    NotFound(String),

    /// I/O failure writing or rotating a log file.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
}
