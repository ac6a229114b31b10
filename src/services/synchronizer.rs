//! Snapshot persistence for session actors: claiming on startup, ordered conditional
//! writes, cleanup on termination and recovery after a restart.

use std::time::{Duration, SystemTime};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::SessionSnapshotEntity, snapshot_store::SnapshotStore, storage::StorageError,
    },
    error::ServiceError,
    services::session_actor,
    state::{SharedState, node_pool::GuildId, session::SessionInput},
};

/// Upper bound on waiting for the last write when a session shuts down.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Load the guild's snapshot and make this replica its owner.
///
/// A snapshot already owned here is returned untouched. A foreign one is rewritten with
/// this replica as owner at the next revision; losing that conditional write re-reads and
/// tries again up to the configured number of attempts.
pub async fn load_and_claim(
    state: &SharedState,
    guild_id: GuildId,
) -> Result<Option<SessionSnapshotEntity>, ServiceError> {
    let store = state.require_snapshot_store().await?;
    let replica_id = state.replica_id();
    let attempts = state.config().session.snapshot_claim_attempts;
    let mut last_conflict = None;

    for attempt in 1..=attempts {
        let Some(mut snapshot) = store.find_snapshot(guild_id).await? else {
            return Ok(None);
        };
        if snapshot.owner_replica_id == replica_id {
            return Ok(Some(snapshot));
        }

        let previous_owner =
            std::mem::replace(&mut snapshot.owner_replica_id, replica_id.to_owned());
        snapshot.revision += 1;
        snapshot.updated_at = SystemTime::now();

        match store.save_snapshot(snapshot.clone()).await {
            Ok(()) => {
                info!(
                    guild_id,
                    previous_owner = %previous_owner,
                    revision = snapshot.revision,
                    "took over session"
                );
                return Ok(Some(snapshot));
            }
            Err(err @ StorageError::Conflict { .. }) => {
                debug!(guild_id, attempt, error = %err, "lost a takeover race; re-reading snapshot");
                last_conflict = Some(err);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(last_conflict
        .map(ServiceError::from)
        .unwrap_or_else(|| ServiceError::Conflict(format!("could not claim guild {guild_id}"))))
}

/// Delete the guild's snapshot if this replica still owns it.
///
/// Returns whether the guild still belongs to this replica, so the caller knows if it may
/// leave voice. Without a store the delete is queued until one is installed again.
pub async fn discard(state: &SharedState, guild_id: GuildId, revision: u64) -> bool {
    let Some(store) = state.snapshot_store().await else {
        info!(guild_id, revision, "snapshot store unavailable; deleting the snapshot once it returns");
        state
            .pending_discards()
            .entry(guild_id)
            .and_modify(|pending| *pending = (*pending).max(revision))
            .or_insert(revision);
        tokio::spawn(discard_when_ready(state.clone(), guild_id));
        return true;
    };
    delete_owned(state, store.as_ref(), guild_id, revision).await
}

async fn discard_when_ready(state: SharedState, guild_id: GuildId) {
    let mut degraded = state.degraded_watcher();
    loop {
        if degraded.wait_for(|degraded| !*degraded).await.is_err() {
            return;
        }
        if let Some(store) = state.snapshot_store().await {
            let Some(revision) = state.pending_discards().get(&guild_id).map(|pending| *pending)
            else {
                return;
            };
            delete_owned(&state, store.as_ref(), guild_id, revision).await;
            state
                .pending_discards()
                .remove_if(&guild_id, |_, pending| *pending == revision);
            return;
        }
        if degraded.changed().await.is_err() {
            return;
        }
    }
}

async fn delete_owned(
    state: &SharedState,
    store: &dyn SnapshotStore,
    guild_id: GuildId,
    revision: u64,
) -> bool {
    let replica_id = state.replica_id();

    match store
        .delete_snapshot(guild_id, replica_id.to_owned(), revision)
        .await
    {
        Ok(true) => {
            debug!(guild_id, revision, "session snapshot deleted");
            true
        }
        Ok(false) => match store.find_snapshot(guild_id).await {
            Ok(Some(stored)) if stored.owner_replica_id != replica_id => {
                info!(guild_id, owner = %stored.owner_replica_id, "snapshot belongs to another replica; keeping it");
                false
            }
            _ => true,
        },
        Err(err) => {
            warn!(guild_id, error = %err, "failed to delete session snapshot");
            true
        }
    }
}

/// Start actors for every stored session this replica owns.
pub async fn recover_owned(state: &SharedState) -> Result<usize, ServiceError> {
    let store = state.require_snapshot_store().await?;
    let snapshots = store.list_snapshots().await?;

    let mut recovered = 0;
    for snapshot in snapshots.iter().filter(|snapshot| {
        snapshot.owner_replica_id == state.replica_id()
            && !state
                .pending_discards()
                .get(&snapshot.guild_id)
                .is_some_and(|pending| *pending >= snapshot.revision)
    }) {
        session_actor::ensure_session(state, snapshot.guild_id);
        recovered += 1;
    }

    info!(recovered, "recovered sessions owned by this replica");
    Ok(recovered)
}

/// Wait for the snapshot store, then run [`recover_owned`] once.
pub async fn recover_when_ready(state: SharedState) {
    let mut degraded = state.degraded_watcher();
    if degraded.wait_for(|degraded| !*degraded).await.is_err() {
        return;
    }
    if let Err(err) = recover_owned(&state).await {
        warn!(error = %err, "session recovery failed");
    }
}

/// Background writer persisting one session's snapshots in revision order.
///
/// Only the newest pending snapshot is kept; a write in flight is never overtaken by an
/// older one because the writer handles them one at a time.
pub struct SnapshotWriter {
    pending: watch::Sender<Option<SessionSnapshotEntity>>,
    task: JoinHandle<()>,
}

impl SnapshotWriter {
    /// Spawn the writer. Rejected writes are reported to `mailbox`.
    pub fn spawn(
        state: SharedState,
        guild_id: GuildId,
        mailbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let (pending, receiver) = watch::channel(None);
        let task = tokio::spawn(write_loop(state, guild_id, receiver, mailbox));
        Self { pending, task }
    }

    /// Replace the pending snapshot.
    pub fn publish(&self, snapshot: SessionSnapshotEntity) {
        self.pending.send_replace(Some(snapshot));
    }

    /// Write whatever is still pending and stop.
    pub async fn flush(self) {
        let Self { pending, task } = self;
        drop(pending);
        if timeout(FLUSH_TIMEOUT, task).await.is_err() {
            warn!("timed out flushing session snapshot");
        }
    }

    /// Stop without writing.
    pub fn abort(self) {
        self.task.abort();
    }
}

async fn write_loop(
    state: SharedState,
    guild_id: GuildId,
    mut pending: watch::Receiver<Option<SessionSnapshotEntity>>,
    mailbox: mpsc::UnboundedSender<SessionInput>,
) {
    let mut degraded = state.degraded_watcher();
    let mut written_revision = 0;

    loop {
        tokio::select! {
            changed = pending.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = degraded.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(snapshot) = pending.borrow_and_update().clone() else {
            continue;
        };
        if snapshot.revision <= written_revision {
            continue;
        }
        if state.is_degraded() {
            debug!(guild_id, revision = snapshot.revision, "degraded mode; snapshot write deferred");
            continue;
        }
        let Some(store) = state.snapshot_store().await else {
            continue;
        };

        let revision = snapshot.revision;
        match store.save_snapshot(snapshot).await {
            Ok(()) => {
                written_revision = revision;
                debug!(guild_id, revision, "session snapshot written");
            }
            Err(StorageError::Conflict {
                stored_revision,
                stored_owner,
                ..
            }) => {
                let lost = stored_owner != state.replica_id();
                debug!(guild_id, revision, stored_revision, stored_owner = %stored_owner, "snapshot write rejected");
                let _ = mailbox.send(SessionInput::SnapshotRejected {
                    stored_revision,
                    stored_owner,
                });
                if lost {
                    break;
                }
            }
            Err(err) => {
                warn!(guild_id, revision, error = %err, "failed to write session snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        clients::fake::FakeNodeClient,
        config::AppConfig,
        dao::{
            models::RepeatModeEntity,
            snapshot_store::{SnapshotStore, memory::MemorySnapshotStore},
        },
        state::AppState,
    };

    fn snapshot(guild_id: u64, revision: u64, owner: &str) -> SessionSnapshotEntity {
        SessionSnapshotEntity {
            guild_id,
            revision,
            owner_replica_id: owner.into(),
            tracks: Vec::new(),
            play_order: None,
            cursor_index: None,
            pending_index: 0,
            repeat_mode: RepeatModeEntity::None,
            voice_channel_id: None,
            last_node_id: None,
            active: false,
            paused: false,
            updated_at: SystemTime::now(),
        }
    }

    async fn state_with_store(replica_id: &str) -> (SharedState, MemorySnapshotStore) {
        let mut config = AppConfig::default();
        config.replica_id = replica_id.into();
        let state = AppState::new(config, Arc::new(FakeNodeClient::default()), None);
        let store = MemorySnapshotStore::new();
        state.install_snapshot_store(Arc::new(store.clone())).await;
        (state, store)
    }

    #[tokio::test]
    async fn claiming_a_foreign_snapshot_bumps_revision_and_owner() {
        let (state, store) = state_with_store("replica-b").await;
        store.save_snapshot(snapshot(1, 4, "replica-a")).await.unwrap();

        let claimed = load_and_claim(&state, 1).await.unwrap().unwrap();
        assert_eq!(claimed.owner_replica_id, "replica-b");
        assert_eq!(claimed.revision, 5);

        let stored = store.find_snapshot(1).await.unwrap().unwrap();
        assert_eq!(stored.owner_replica_id, "replica-b");

        // Already ours: nothing is written.
        let again = load_and_claim(&state, 1).await.unwrap().unwrap();
        assert_eq!(again.revision, 5);
    }

    #[tokio::test]
    async fn missing_snapshot_claims_nothing() {
        let (state, _store) = state_with_store("replica-b").await;
        assert!(load_and_claim(&state, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_keeps_snapshots_of_other_owners() {
        let (state, store) = state_with_store("replica-a").await;
        store.save_snapshot(snapshot(1, 3, "replica-b")).await.unwrap();
        assert!(!discard(&state, 1, 10).await);
        assert!(store.find_snapshot(1).await.unwrap().is_some());

        store.save_snapshot(snapshot(2, 3, "replica-a")).await.unwrap();
        assert!(discard(&state, 2, 3).await);
        assert!(store.find_snapshot(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_without_a_store_deletes_once_it_returns() {
        let (state, store) = state_with_store("replica-a").await;
        store.save_snapshot(snapshot(4, 6, "replica-a")).await.unwrap();
        state.clear_snapshot_store().await;

        assert!(discard(&state, 4, 6).await);
        assert!(store.find_snapshot(4).await.unwrap().is_some());
        assert_eq!(state.pending_discards().get(&4).map(|pending| *pending), Some(6));

        // The ended session must not come back when the store does.
        state.install_snapshot_store(Arc::new(store.clone())).await;
        assert_eq!(recover_owned(&state).await.unwrap(), 0);

        timeout(Duration::from_secs(1), async {
            while !state.pending_discards().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queued delete ran");
        assert!(store.find_snapshot(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_reports_rejections_and_stops_after_losing_ownership() {
        let (state, store) = state_with_store("replica-a").await;
        store.save_snapshot(snapshot(1, 10, "replica-b")).await.unwrap();

        let (mailbox, mut inbox) = mpsc::unbounded_channel();
        let writer = SnapshotWriter::spawn(state.clone(), 1, mailbox);
        writer.publish(snapshot(1, 7, "replica-a"));

        match inbox.recv().await {
            Some(SessionInput::SnapshotRejected {
                stored_revision,
                stored_owner,
            }) => {
                assert_eq!(stored_revision, 10);
                assert_eq!(stored_owner, "replica-b");
            }
            other => panic!("unexpected input {other:?}"),
        }
        writer.flush().await;
        assert_eq!(store.find_snapshot(1).await.unwrap().unwrap().revision, 10);
    }

    #[tokio::test]
    async fn flush_writes_the_latest_pending_snapshot() {
        let (state, store) = state_with_store("replica-a").await;
        let (mailbox, _inbox) = mpsc::unbounded_channel();
        let writer = SnapshotWriter::spawn(state, 1, mailbox);

        writer.publish(snapshot(1, 1, "replica-a"));
        writer.publish(snapshot(1, 2, "replica-a"));
        writer.flush().await;

        assert_eq!(store.find_snapshot(1).await.unwrap().unwrap().revision, 2);
    }
}
