//! Error types for the capture side.

use std::time::Duration;

use thiserror::Error;

/// Capture pipeline error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Core setup error (configuration, keys, converter graph).
    #[error("Core error: {0}")]
    Core(#[from] rbel_core::CoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Trace file error.
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Scheduler error type, delivered to continuations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The future did not resolve within the configured time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The future panicked or was aborted.
    #[error("task was cancelled")]
    Cancelled,

    /// The scheduler runtime is gone.
    #[error("scheduler is shut down")]
    Shutdown,
}

/// Trace file error type.
#[derive(Debug, Error)]
pub enum TraceError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a valid record.
    #[error("invalid record on line {line}: {source}")]
    Record {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Serialisation failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The raw payload is not base64.
    #[error("invalid payload for {uuid}: {reason}")]
    Payload { uuid: uuid::Uuid, reason: String },
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
