use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dao::models::SessionSnapshotEntity;

pub const SESSION_PREFIX: &str = "session::";
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// Snapshot document; `_rev` is CouchDB's MVCC token, unrelated to the session revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchSnapshotDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub snapshot: SessionSnapshotEntity,
}

impl From<(SessionSnapshotEntity, Option<String>)> for CouchSnapshotDocument {
    fn from((snapshot, rev): (SessionSnapshotEntity, Option<String>)) -> Self {
        Self {
            id: session_doc_id(snapshot.guild_id),
            rev,
            snapshot,
        }
    }
}

pub fn session_doc_id(guild_id: u64) -> String {
    format!("{}{}", SESSION_PREFIX, guild_id)
}
