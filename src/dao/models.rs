use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Persisted projection of one guild's playback session.
///
/// Written to the shared store after every change of queue contents, cursor or mode so that
/// another replica can reconstruct the session. Transient node state (player position,
/// node socket) is deliberately absent. Unknown fields are ignored on read and every field
/// added after the first release carries a serde default, so replicas running different
/// versions can read each other's snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshotEntity {
    /// Guild the session belongs to.
    pub guild_id: u64,
    /// Session revision at the time the snapshot was taken.
    pub revision: u64,
    /// Replica that owned the session when writing this snapshot.
    pub owner_replica_id: String,
    /// Queue contents in enqueue order.
    pub tracks: Vec<TrackEntity>,
    /// Play order as indices into `tracks` while shuffle is active.
    #[serde(default)]
    pub play_order: Option<Vec<usize>>,
    /// Play-order position of the current track, if one is selected.
    #[serde(default)]
    pub cursor_index: Option<usize>,
    /// Play-order position the queue resumes from when no track is current.
    #[serde(default)]
    pub pending_index: usize,
    /// Repeat mode flag.
    #[serde(default)]
    pub repeat_mode: RepeatModeEntity,
    /// Voice channel the bot was connected to.
    #[serde(default)]
    pub voice_channel_id: Option<u64>,
    /// Last node the session streamed through; used as an acquisition hint.
    #[serde(default)]
    pub last_node_id: Option<String>,
    /// Whether a node was assigned (or being assigned) when the snapshot was written.
    #[serde(default)]
    pub active: bool,
    /// Whether playback was paused when the snapshot was written.
    #[serde(default)]
    pub paused: bool,
    /// Wall-clock time of the write.
    pub updated_at: SystemTime,
}

/// Track entry stored inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackEntity {
    /// Node-side track identifier (opaque encoded track).
    pub identifier: String,
    /// Source URI the track was resolved from.
    pub uri: String,
    /// Display title.
    pub title: String,
    /// Track length in milliseconds.
    pub duration_ms: u64,
    /// User who requested the track.
    #[serde(default)]
    pub requester: Option<RequesterEntity>,
}

/// User reference attached to a requested track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequesterEntity {
    /// Chat platform user id.
    pub user_id: u64,
    /// Name displayed at request time.
    pub display_name: String,
}

/// Persisted repeat mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatModeEntity {
    /// Play through once.
    #[default]
    None,
    /// Loop the current track.
    Track,
    /// Loop the whole queue.
    Queue,
}
