//! Error types for the backup orchestrator.

/// Top-level error type for task orchestration.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A task body failed for a reason of its own.
    #[error("task error: {0}")]
    Task(String),

    /// The backup executor hit an unexpected condition (not a plain failed attempt).
    #[error("executor error: {0}")]
    Executor(String),

    /// A task referenced a console that no longer exists.
    #[error("console {0} not found")]
    ConsoleNotFound(u32),

    /// Console management rejected the request.
    #[error("console error: {0}")]
    Console(String),

    /// Persisted application state could not be read or written.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Timer registration error.
    #[error("timer error: {0}")]
    Timer(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
