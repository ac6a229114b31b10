use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database,
    bson::doc,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tokio::sync::RwLock;

use super::{
    config::MongoConfig,
    connection::open_database,
    error::{MongoDaoError, MongoResult},
    models::{MongoSnapshotDocument, doc_id, revision_as_i64},
};
use crate::dao::{
    models::SessionSnapshotEntity,
    snapshot_store::SnapshotStore,
    storage::{StorageError, StorageResult},
};

const SNAPSHOT_COLLECTION_NAME: &str = "session_snapshots";
const DUPLICATE_KEY_CODE: i32 = 11000;

/// [`SnapshotStore`] backed by a MongoDB collection, one document per guild.
#[derive(Clone)]
pub struct MongoSnapshotStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let database = open_database(&self.config).await?;
        self.state.write().await.database = database;
        Ok(())
    }
}

impl MongoSnapshotStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let database = open_database(&config).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let collection = self.collection().await;
        let index = mongodb::IndexModel::builder()
            .keys(doc! {"owner_replica_id": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("snapshot_owner_idx".to_owned()))
                    .build(),
            )
            .build();

        collection
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SNAPSHOT_COLLECTION_NAME,
                index: "owner_replica_id",
                source,
            })?;

        Ok(())
    }

    async fn collection(&self) -> Collection<MongoSnapshotDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoSnapshotDocument>(SNAPSHOT_COLLECTION_NAME)
    }

    /// Replace the document only while its revision is lower than ours.
    ///
    /// When the stored revision is equal or higher the filter matches nothing and the
    /// upsert collides with the existing `_id`, which is reported as a conflict.
    async fn save_snapshot(&self, snapshot: SessionSnapshotEntity) -> StorageResult<()> {
        let guild_id = snapshot.guild_id;
        let revision = snapshot.revision;
        let document: MongoSnapshotDocument = snapshot.into();
        let collection = self.collection().await;

        let result = collection
            .replace_one(
                doc! {
                    "_id": guild_id.to_string(),
                    "revision": { "$lt": revision_as_i64(revision) },
                },
                &document,
            )
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => {
                let stored = self.find_snapshot(guild_id).await.ok().flatten();
                Err(StorageError::Conflict {
                    guild_id,
                    stored_revision: stored.as_ref().map_or(revision, |s| s.revision),
                    stored_owner: stored.map(|s| s.owner_replica_id).unwrap_or_default(),
                })
            }
            Err(source) => Err(MongoDaoError::SaveSnapshot { guild_id, source }.into()),
        }
    }

    async fn find_snapshot(&self, guild_id: u64) -> MongoResult<Option<SessionSnapshotEntity>> {
        let collection = self.collection().await;

        let document = collection
            .find_one(doc_id(guild_id))
            .await
            .map_err(|source| MongoDaoError::LoadSnapshot { guild_id, source })?;

        document.map(TryInto::try_into).transpose()
    }

    async fn delete_snapshot(
        &self,
        guild_id: u64,
        owner: String,
        max_revision: u64,
    ) -> MongoResult<bool> {
        let collection = self.collection().await;
        let result = collection
            .delete_one(doc! {
                "_id": guild_id.to_string(),
                "owner_replica_id": owner,
                "revision": { "$lte": revision_as_i64(max_revision) },
            })
            .await
            .map_err(|source| MongoDaoError::DeleteSnapshot { guild_id, source })?;
        Ok(result.deleted_count > 0)
    }

    async fn list_snapshots(&self) -> MongoResult<Vec<SessionSnapshotEntity>> {
        let collection = self.collection().await;

        let documents: Vec<MongoSnapshotDocument> = collection
            .find(doc! {})
            .await
            .map_err(|source| MongoDaoError::ListSnapshots { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListSnapshots { source })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

impl SnapshotStore for MongoSnapshotStore {
    fn save_snapshot(&self, snapshot: SessionSnapshotEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_snapshot(snapshot).await })
    }

    fn find_snapshot(&self, guild_id: u64) -> BoxFuture<'static, StorageResult<Option<SessionSnapshotEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_snapshot(guild_id).await.map_err(Into::into) })
    }

    fn delete_snapshot(
        &self,
        guild_id: u64,
        owner: String,
        max_revision: u64,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .delete_snapshot(guild_id, owner, max_revision)
                .await
                .map_err(Into::into)
        })
    }

    fn list_snapshots(&self) -> BoxFuture<'static, StorageResult<Vec<SessionSnapshotEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_snapshots().await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
