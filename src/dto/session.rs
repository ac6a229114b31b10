use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    dto::format_system_time,
    state::{
        queue::{RepeatMode, Requester, Track},
        session::Session,
        session_machine::{AssignReason, SessionPhase},
    },
};

/// Repeat mode exposed over the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RepeatModeDto {
    /// Stop after the last track.
    None,
    /// Repeat the current track.
    Track,
    /// Wrap around to the first track.
    Queue,
}

impl From<RepeatModeDto> for RepeatMode {
    fn from(value: RepeatModeDto) -> Self {
        match value {
            RepeatModeDto::None => RepeatMode::None,
            RepeatModeDto::Track => RepeatMode::Track,
            RepeatModeDto::Queue => RepeatMode::Queue,
        }
    }
}

impl From<RepeatMode> for RepeatModeDto {
    fn from(value: RepeatMode) -> Self {
        match value {
            RepeatMode::None => RepeatModeDto::None,
            RepeatMode::Track => RepeatModeDto::Track,
            RepeatMode::Queue => RepeatModeDto::Queue,
        }
    }
}

/// Lifecycle phase of a session as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhaseDto {
    /// No node held.
    Idle,
    /// Acquiring a node for a fresh start.
    Assigning,
    /// Moving playback to another node.
    Migrating,
    /// Resuming a recovered session.
    Restoring,
    /// Streaming.
    Playing,
    /// Paused on a node.
    Paused,
    /// Stopping on request.
    Stopping,
    /// Stopped after an unrecoverable failure.
    Faulted,
    /// Ended.
    Terminated,
}

impl From<SessionPhase> for SessionPhaseDto {
    fn from(value: SessionPhase) -> Self {
        match value {
            SessionPhase::Idle => SessionPhaseDto::Idle,
            SessionPhase::Assigning(AssignReason::Initial) => SessionPhaseDto::Assigning,
            SessionPhase::Assigning(AssignReason::Migration { .. }) => SessionPhaseDto::Migrating,
            SessionPhase::Assigning(AssignReason::Restore { .. }) => SessionPhaseDto::Restoring,
            SessionPhase::Playing => SessionPhaseDto::Playing,
            SessionPhase::Paused => SessionPhaseDto::Paused,
            SessionPhase::Stopping => SessionPhaseDto::Stopping,
            SessionPhase::Faulted(_) => SessionPhaseDto::Faulted,
            SessionPhase::Terminated => SessionPhaseDto::Terminated,
        }
    }
}

/// User reference attached to a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RequesterView {
    /// User snowflake.
    pub user_id: u64,
    /// Name shown next to the track.
    pub display_name: String,
}

/// Track as listed in a session view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct TrackView {
    /// Node-side track identifier.
    pub identifier: String,
    /// Source URL.
    pub uri: String,
    /// Display title.
    pub title: String,
    /// Track length in milliseconds.
    pub duration_ms: u64,
    /// User who asked for the track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<RequesterView>,
}

impl From<&Track> for TrackView {
    fn from(track: &Track) -> Self {
        Self {
            identifier: track.identifier.clone(),
            uri: track.uri.clone(),
            title: track.title.clone(),
            duration_ms: track.duration_ms,
            requester: track.requester.as_ref().map(RequesterView::from),
        }
    }
}

impl From<&Requester> for RequesterView {
    fn from(requester: &Requester) -> Self {
        Self {
            user_id: requester.user_id,
            display_name: requester.display_name.clone(),
        }
    }
}

/// Read-only projection of a guild's session returned by commands and inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SessionView {
    /// Guild snowflake.
    pub guild_id: u64,
    /// Revision of the last state change.
    pub revision: u64,
    /// Replica running the session.
    pub owner_replica_id: String,
    /// Lifecycle phase.
    pub phase: SessionPhaseDto,
    /// Node currently streaming for the guild.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Voice channel the bot joins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_channel_id: Option<u64>,
    /// Active repeat mode.
    pub repeat_mode: RepeatModeDto,
    /// Whether the play order is shuffled.
    pub shuffled: bool,
    /// Play-order position of the current track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,
    /// Track at the cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<TrackView>,
    /// Last reported position within the current track.
    pub position_ms: u64,
    /// Tracks after the cursor, in play order.
    pub upcoming: Vec<TrackView>,
    /// Tracks before the cursor, in play order.
    pub history: Vec<TrackView>,
    /// Length of the current streak of failed tracks.
    pub consecutive_failures: u32,
    /// RFC 3339 time of the last user or playback activity.
    pub last_activity: String,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        let queue = session.queue();
        Self {
            guild_id: session.guild_id(),
            revision: session.revision(),
            owner_replica_id: session.owner_replica_id().to_string(),
            phase: session.phase().into(),
            node_id: session.node().map(|node| node.node_id.clone()),
            voice_channel_id: session.voice_channel_id(),
            repeat_mode: queue.mode().into(),
            shuffled: queue.is_shuffled(),
            cursor: queue.cursor(),
            current: queue.current().map(TrackView::from),
            position_ms: session.position_ms(),
            upcoming: queue.upcoming().into_iter().map(TrackView::from).collect(),
            history: queue.history().into_iter().map(TrackView::from).collect(),
            consecutive_failures: session.consecutive_failures(),
            last_activity: format_system_time(session.last_activity_at()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::session_machine::SessionEvent;

    fn track(id: &str) -> Track {
        Track {
            identifier: id.into(),
            uri: format!("https://example.com/{id}"),
            title: id.into(),
            duration_ms: 1_000,
            requester: Some(Requester {
                user_id: 5,
                display_name: "dj".into(),
            }),
        }
    }

    #[test]
    fn view_splits_history_current_and_upcoming() {
        let mut session = Session::new(3, "replica");
        for id in ["a", "b", "c"] {
            session.queue_mut().enqueue(track(id));
        }
        session.queue_mut().move_to(1).unwrap();
        session
            .apply(SessionEvent::Start(AssignReason::Migration {
                resume_paused: false,
            }))
            .unwrap();

        let view = SessionView::from(&session);
        assert_eq!(view.phase, SessionPhaseDto::Migrating);
        assert_eq!(view.cursor, Some(1));
        assert_eq!(view.current.as_ref().map(|t| t.identifier.as_str()), Some("b"));
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.upcoming.len(), 1);
        assert_eq!(view.upcoming[0].requester.as_ref().unwrap().user_id, 5);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["phase"], "migrating");
        assert_eq!(json["repeat_mode"], "none");
        assert!(json.get("node_id").is_none());
    }
}
