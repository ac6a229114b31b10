use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};

use super::error::MongoDaoError;
use crate::dao::models::{RepeatModeEntity, SessionSnapshotEntity, TrackEntity};

/// Snapshot document keyed by the guild id rendered as a string, since BSON has no
/// unsigned 64-bit integer. Revisions are stored as `i64` for the same reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSnapshotDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub revision: i64,
    pub owner_replica_id: String,
    pub tracks: Vec<TrackEntity>,
    #[serde(default)]
    pub play_order: Option<Vec<u32>>,
    #[serde(default)]
    pub cursor_index: Option<u32>,
    #[serde(default)]
    pub pending_index: u32,
    #[serde(default)]
    pub repeat_mode: RepeatModeEntity,
    #[serde(default)]
    pub voice_channel_id: Option<String>,
    #[serde(default)]
    pub last_node_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub paused: bool,
    pub updated_at: DateTime,
}

impl From<SessionSnapshotEntity> for MongoSnapshotDocument {
    fn from(value: SessionSnapshotEntity) -> Self {
        Self {
            id: value.guild_id.to_string(),
            revision: revision_as_i64(value.revision),
            owner_replica_id: value.owner_replica_id,
            tracks: value.tracks,
            play_order: value
                .play_order
                .map(|order| order.into_iter().map(|index| index as u32).collect()),
            cursor_index: value.cursor_index.map(|index| index as u32),
            pending_index: value.pending_index as u32,
            repeat_mode: value.repeat_mode,
            voice_channel_id: value.voice_channel_id.map(|id| id.to_string()),
            last_node_id: value.last_node_id,
            active: value.active,
            paused: value.paused,
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoSnapshotDocument> for SessionSnapshotEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSnapshotDocument) -> Result<Self, Self::Error> {
        let malformed = |reason| MongoDaoError::MalformedDocument {
            id: value.id.clone(),
            reason,
        };
        let guild_id = value
            .id
            .parse::<u64>()
            .map_err(|_| malformed("guild id is not numeric"))?;
        let revision =
            u64::try_from(value.revision).map_err(|_| malformed("negative revision"))?;
        let voice_channel_id = value
            .voice_channel_id
            .as_deref()
            .map(str::parse::<u64>)
            .transpose()
            .map_err(|_| malformed("voice channel id is not numeric"))?;

        Ok(Self {
            guild_id,
            revision,
            owner_replica_id: value.owner_replica_id,
            tracks: value.tracks,
            play_order: value
                .play_order
                .map(|order| order.into_iter().map(|index| index as usize).collect()),
            cursor_index: value.cursor_index.map(|index| index as usize),
            pending_index: value.pending_index as usize,
            repeat_mode: value.repeat_mode,
            voice_channel_id,
            last_node_id: value.last_node_id,
            active: value.active,
            paused: value.paused,
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

pub fn revision_as_i64(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

pub fn doc_id(guild_id: u64) -> Document {
    doc! {"_id": guild_id.to_string()}
}
