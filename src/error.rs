use thiserror::Error;

/// Errors surfaced by the persistence and derivation engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("{table} {id} not found")]
    NotFound { table: &'static str, id: i64 },

    /// A refresh already holds the lock for this media item
    #[error("MediaItem {0} is locked")]
    Locked(i64),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Refresh of MediaItem {0} aborted unexpectedly")]
    RefreshAborted(i64),

    #[error("Metadata provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
