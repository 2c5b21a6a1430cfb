//! Error types for the reminder engine.

/// Top-level error type for the notification scheduler and its stores.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// A task, subscription, profile or ledger store could not be read or written.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Push credentials are absent, so delivery stages are disabled.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Configuration file could not be parsed or failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// A task record carries values the engine cannot interpret.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Scheduler error (lease handling, tick orchestration).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for NotifyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, NotifyError>;
