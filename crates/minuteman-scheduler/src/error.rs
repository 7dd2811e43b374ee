use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Faults raised by job bodies are deliberately absent: the dispatcher turns
/// them into persisted job state instead of returning them.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column (timeplan, task result) could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The provided timeplan document is malformed.
    #[error("Invalid timeplan: {0}")]
    InvalidTimeplan(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No backend is registered under the job's method reference.
    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    /// A backend's `reschedule` hook panicked while reconciling an orphan.
    #[error("reschedule hook panicked for method {method}")]
    ReschedulePanicked { method: String },

    /// `cleanup` was called outside the tick loop without `force`.
    ///
    /// This is a usage error, not a runtime condition: callers must not
    /// recover from it.
    #[error("cleanup must run from inside a scheduler tick (pass force to override)")]
    CleanupOutsideTick,

    /// A thread panicked while holding the database connection.
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
