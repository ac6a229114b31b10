#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use crate::dao::models::SessionSnapshotEntity;
use crate::dao::storage::StorageResult;
use futures::future::BoxFuture;

/// Shared store holding one session snapshot per guild.
///
/// Writes are conditional on the revision: `save_snapshot` succeeds only when the stored
/// revision is strictly lower than the incoming one and fails with
/// [`StorageError::Conflict`](crate::dao::storage::StorageError::Conflict) otherwise.
pub trait SnapshotStore: Send + Sync {
    /// Write a snapshot if it is newer than the stored one.
    fn save_snapshot(&self, snapshot: SessionSnapshotEntity) -> BoxFuture<'static, StorageResult<()>>;
    /// Read the latest snapshot of a guild.
    fn find_snapshot(&self, guild_id: u64) -> BoxFuture<'static, StorageResult<Option<SessionSnapshotEntity>>>;
    /// Delete a guild's snapshot if it is still owned by `owner` at a revision not above
    /// `max_revision`. Returns whether a document was deleted.
    fn delete_snapshot(
        &self,
        guild_id: u64,
        owner: String,
        max_revision: u64,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// List every stored snapshot.
    fn list_snapshots(&self) -> BoxFuture<'static, StorageResult<Vec<SessionSnapshotEntity>>>;
    /// Cheap round trip proving the backend still answers.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
