//! Process-local snapshot store used in single-replica mode and in tests.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;

use crate::dao::{
    models::SessionSnapshotEntity,
    snapshot_store::SnapshotStore,
    storage::{StorageError, StorageResult},
};

/// Snapshot store keeping documents in a concurrent map.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<DashMap<u64, SessionSnapshotEntity>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn save(&self, snapshot: SessionSnapshotEntity) -> StorageResult<()> {
        match self.snapshots.entry(snapshot.guild_id) {
            Entry::Occupied(mut stored) if stored.get().revision < snapshot.revision => {
                stored.insert(snapshot);
                Ok(())
            }
            Entry::Occupied(stored) => Err(StorageError::Conflict {
                guild_id: snapshot.guild_id,
                stored_revision: stored.get().revision,
                stored_owner: stored.get().owner_replica_id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
                Ok(())
            }
        }
    }

    fn delete(&self, guild_id: u64, owner: &str, max_revision: u64) -> bool {
        self.snapshots
            .remove_if(&guild_id, |_, stored| {
                stored.owner_replica_id == owner && stored.revision <= max_revision
            })
            .is_some()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(&self, snapshot: SessionSnapshotEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save(snapshot) })
    }

    fn find_snapshot(&self, guild_id: u64) -> BoxFuture<'static, StorageResult<Option<SessionSnapshotEntity>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.snapshots.get(&guild_id).map(|entry| entry.clone())) })
    }

    fn delete_snapshot(
        &self,
        guild_id: u64,
        owner: String,
        max_revision: u64,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.delete(guild_id, &owner, max_revision)) })
    }

    fn list_snapshots(&self) -> BoxFuture<'static, StorageResult<Vec<SessionSnapshotEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .snapshots
                .iter()
                .map(|entry| entry.value().clone())
                .collect())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn snapshot(guild_id: u64, revision: u64, owner: &str) -> SessionSnapshotEntity {
        SessionSnapshotEntity {
            guild_id,
            revision,
            owner_replica_id: owner.into(),
            tracks: Vec::new(),
            play_order: None,
            cursor_index: None,
            pending_index: 0,
            repeat_mode: Default::default(),
            voice_channel_id: None,
            last_node_id: None,
            active: false,
            paused: false,
            updated_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn writes_with_equal_or_lower_revision_are_rejected() {
        let store = MemorySnapshotStore::new();
        store.save_snapshot(snapshot(1, 5, "replica-a")).await.unwrap();

        for revision in [3, 5] {
            let err = store
                .save_snapshot(snapshot(1, revision, "replica-b"))
                .await
                .unwrap_err();
            match err {
                StorageError::Conflict {
                    guild_id,
                    stored_revision,
                    stored_owner,
                } => {
                    assert_eq!(guild_id, 1);
                    assert_eq!(stored_revision, 5);
                    assert_eq!(stored_owner, "replica-a");
                }
                other => panic!("expected conflict, got {other:?}"),
            }
        }

        store.save_snapshot(snapshot(1, 6, "replica-b")).await.unwrap();
        let stored = store.find_snapshot(1).await.unwrap().unwrap();
        assert_eq!(stored.revision, 6);
        assert_eq!(stored.owner_replica_id, "replica-b");
    }

    #[tokio::test]
    async fn concurrent_writers_leave_the_highest_revision() {
        let store = MemorySnapshotStore::new();
        let mut tasks = Vec::new();
        for revision in 1..=64u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let _ = store.save_snapshot(snapshot(9, revision, "replica")).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.find_snapshot(9).await.unwrap().unwrap().revision, 64);
    }

    #[tokio::test]
    async fn delete_requires_matching_owner_and_revision() {
        let store = MemorySnapshotStore::new();
        store.save_snapshot(snapshot(2, 4, "replica-a")).await.unwrap();

        assert!(!store.delete_snapshot(2, "replica-b".into(), 10).await.unwrap());
        assert!(!store.delete_snapshot(2, "replica-a".into(), 3).await.unwrap());
        assert!(store.delete_snapshot(2, "replica-a".into(), 4).await.unwrap());
        assert!(store.find_snapshot(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_every_guild() {
        let store = MemorySnapshotStore::new();
        store.save_snapshot(snapshot(1, 1, "a")).await.unwrap();
        store.save_snapshot(snapshot(2, 1, "a")).await.unwrap();

        let mut guilds: Vec<u64> = store
            .list_snapshots()
            .await
            .unwrap()
            .into_iter()
            .map(|snapshot| snapshot.guild_id)
            .collect();
        guilds.sort_unstable();
        assert_eq!(guilds, vec![1, 2]);
    }
}
