//! Error types for taskq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller violated a precondition. The operation had no side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced task is not (or no longer) in the queue.
    #[error("not found: {0}")]
    NotFound(String),

    /// A task with the same UUID is already queued.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
