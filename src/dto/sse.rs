use serde::Serialize;
use utoipa::ToSchema;

use crate::dto::session::{SessionView, TrackView};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name, if any.
    pub event: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Identifier of the SSE stream (`sessions` or `guild:<id>`).
    pub stream: String,
    /// Human-readable message confirming the subscription.
    pub message: String,
    /// Whether the replica is running without its snapshot store.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the replica enters or leaves degraded mode.
pub struct SystemStatus {
    /// Whether the replica is running without its snapshot store.
    pub degraded: bool,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// A user asked the bot to leave.
    Left,
    /// Nothing happened for longer than the idle timeout.
    IdleTimeout,
    /// The voice channel stayed empty for longer than the idle timeout.
    ChannelEmpty,
    /// The bot was disconnected from voice externally.
    ForcedDisconnect,
    /// Another replica took the session over.
    OwnershipLost,
}

/// Session lifecycle notification fanned out to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotification {
    /// The session moved to a new revision.
    StateChanged {
        /// Session after the change.
        session: SessionView,
    },
    /// Playback stopped because no node could take over after a failure.
    PlaybackInterrupted {
        /// Affected guild.
        guild_id: u64,
        /// Why no node could be assigned.
        reason: String,
    },
    /// A track failed and was skipped.
    TrackSkipped {
        /// Affected guild.
        guild_id: u64,
        /// The skipped track.
        track: TrackView,
        /// Failure reported by the node.
        reason: String,
        /// Failures in a row so far.
        consecutive_failures: u32,
    },
    /// Too many tracks failed in a row; playback stopped with the queue kept.
    FatalQueueError {
        /// Affected guild.
        guild_id: u64,
        /// Failures in a row.
        consecutive_failures: u32,
    },
    /// The session ended.
    Terminated {
        /// Affected guild.
        guild_id: u64,
        /// Why it ended.
        reason: TerminationReason,
    },
}

impl SessionNotification {
    /// Guild the notification is about.
    pub fn guild_id(&self) -> u64 {
        match self {
            SessionNotification::StateChanged { session } => session.guild_id,
            SessionNotification::PlaybackInterrupted { guild_id, .. }
            | SessionNotification::TrackSkipped { guild_id, .. }
            | SessionNotification::FatalQueueError { guild_id, .. }
            | SessionNotification::Terminated { guild_id, .. } => *guild_id,
        }
    }

    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionNotification::StateChanged { .. } => "session.state_changed",
            SessionNotification::PlaybackInterrupted { .. } => "session.playback_interrupted",
            SessionNotification::TrackSkipped { .. } => "session.track_skipped",
            SessionNotification::FatalQueueError { .. } => "session.fatal_queue_error",
            SessionNotification::Terminated { .. } => "session.terminated",
        }
    }
}
