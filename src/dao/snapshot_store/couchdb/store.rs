use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::from_value;
use tracing::debug;

use crate::dao::{
    models::SessionSnapshotEntity,
    snapshot_store::SnapshotStore,
    storage::{StorageError, StorageResult},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{AllDocsResponse, CouchSnapshotDocument, END_SUFFIX, SESSION_PREFIX, session_doc_id},
};

/// Attempts at winning the `_rev` race before giving up on a write.
const MAX_REV_ATTEMPTS: u32 = 3;

/// [`SnapshotStore`] backed by a CouchDB database, one document per guild.
#[derive(Clone)]
pub struct CouchSnapshotStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchSnapshotStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, path);
        let builder = self.client.request(method, url);
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    fn database_request(&self, method: Method) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, self.database);
        let builder = self.client.request(method, url);
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let response = self
            .database_request(Method::GET)
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .database_request(Method::PUT)
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                // 412 means another replica created it first.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<()>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: response.status(),
            })
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: response.status(),
            })
        }
    }

    async fn list_documents<T>(&self, prefix: &str) -> CouchResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", prefix)),
            ("endkey", format!("\"{}{}\"", prefix, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        let mut documents = Vec::new();
        for row in payload.rows {
            if let Some(doc) = row.doc {
                let parsed = from_value(doc).map_err(|source| CouchDaoError::DeserializeValue {
                    path: row.id.clone(),
                    source,
                })?;
                documents.push(parsed);
            }
        }

        Ok(documents)
    }

    /// Compare the stored session revision, then PUT with the stored `_rev`.
    ///
    /// A `409` from CouchDB means another writer slipped in between the read and the write,
    /// so the comparison is redone against the fresh document.
    async fn save_conditional(&self, snapshot: SessionSnapshotEntity) -> StorageResult<()> {
        let doc_id = session_doc_id(snapshot.guild_id);

        for attempt in 1..=MAX_REV_ATTEMPTS {
            let rev = match self.get_document::<CouchSnapshotDocument>(&doc_id).await? {
                Some(stored) if stored.snapshot.revision >= snapshot.revision => {
                    return Err(StorageError::Conflict {
                        guild_id: snapshot.guild_id,
                        stored_revision: stored.snapshot.revision,
                        stored_owner: stored.snapshot.owner_replica_id,
                    });
                }
                Some(stored) => stored.rev,
                None => None,
            };

            let document = CouchSnapshotDocument::from((snapshot.clone(), rev));
            match self.put_document(&doc_id, &document).await {
                Ok(()) => return Ok(()),
                Err(CouchDaoError::RequestStatus {
                    status: StatusCode::CONFLICT,
                    ..
                }) => {
                    debug!(doc_id = %doc_id, attempt, "CouchDB revision conflict; re-reading snapshot");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(CouchDaoError::RevisionContention {
            doc_id,
            attempts: MAX_REV_ATTEMPTS,
        }
        .into())
    }

    async fn delete_conditional(
        &self,
        guild_id: u64,
        owner: &str,
        max_revision: u64,
    ) -> CouchResult<bool> {
        let doc_id = session_doc_id(guild_id);

        for _ in 0..MAX_REV_ATTEMPTS {
            let Some(stored) = self.get_document::<CouchSnapshotDocument>(&doc_id).await? else {
                return Ok(false);
            };
            if stored.snapshot.owner_replica_id != owner || stored.snapshot.revision > max_revision {
                return Ok(false);
            }
            let Some(rev) = stored.rev else {
                return Ok(false);
            };

            match self.delete_document(&doc_id, &rev).await {
                Ok(()) => return Ok(true),
                Err(CouchDaoError::RequestStatus {
                    status: StatusCode::CONFLICT,
                    ..
                }) => continue,
                Err(CouchDaoError::RequestStatus {
                    status: StatusCode::NOT_FOUND,
                    ..
                }) => return Ok(false),
                Err(err) => return Err(err),
            }
        }

        Err(CouchDaoError::RevisionContention {
            doc_id,
            attempts: MAX_REV_ATTEMPTS,
        })
    }
}

impl SnapshotStore for CouchSnapshotStore {
    fn save_snapshot(&self, snapshot: SessionSnapshotEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_conditional(snapshot).await })
    }

    fn find_snapshot(&self, guild_id: u64) -> BoxFuture<'static, StorageResult<Option<SessionSnapshotEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc_id = session_doc_id(guild_id);
            let maybe_doc = store.get_document::<CouchSnapshotDocument>(&doc_id).await?;
            Ok(maybe_doc.map(|doc| doc.snapshot))
        })
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
                .delete_conditional(guild_id, &owner, max_revision)
                .await
                .map_err(Into::into)
        })
    }

    fn list_snapshots(&self) -> BoxFuture<'static, StorageResult<Vec<SessionSnapshotEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let docs = store
                .list_documents::<CouchSnapshotDocument>(SESSION_PREFIX)
                .await?;
            Ok(docs.into_iter().map(|doc| doc.snapshot).collect())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let path = store.database.to_string();
            let response = store
                .database_request(Method::GET)
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: path.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
