use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or answered with an unexpected failure.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Human readable summary of the failure.
        message: String,
        /// Backend specific error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A conditional write was rejected because the stored snapshot is as new or newer.
    #[error(
        "snapshot for guild {guild_id} already at revision {stored_revision} (owner {stored_owner})"
    )]
    Conflict {
        /// Guild whose snapshot was contended.
        guild_id: u64,
        /// Revision currently held by the store.
        stored_revision: u64,
        /// Replica that wrote the stored revision.
        stored_owner: String,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}
