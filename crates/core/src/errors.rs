use thiserror::Error;

/// Error taxonomy for the task creation and scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database operation error: {0}")]
    DatabaseOperation(String),

    #[error("processor filter not found: {id}")]
    FilterNotFound { id: i64 },

    /// The re-select after a bulk insert returned an unexpected row count.
    /// Fatal to the surrounding materialization transaction.
    #[error("selected back {actual} tasks after insertion, expected {expected}")]
    TaskSelectBackMismatch { expected: usize, actual: usize },

    #[error("cluster lock '{name}' not acquired")]
    LockNotAcquired { name: String },

    #[error("invalid batch row: {0}")]
    InvalidBatchRow(String),

    #[error("event search error: {0}")]
    Search(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
