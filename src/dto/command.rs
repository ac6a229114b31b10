//! DTO definitions for the playback command surface.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationErrors};

use crate::{
    dto::{
        session::{RepeatModeDto, SessionView},
        validation::{validate_snowflake, validate_track_identifier},
    },
    error::ServiceError,
    state::{
        queue::{Requester, Track},
        session::Command,
    },
};

/// Guild addressed by a route.
#[derive(Debug, Clone, Copy, Deserialize, IntoParams, Validate)]
#[into_params(parameter_in = Path)]
pub struct GuildPath {
    /// Guild snowflake.
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: u64,
}

/// Track resolved by the caller and submitted for playback.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct TrackInput {
    /// Node-side track identifier, echoed in track events.
    #[validate(custom(function = "validate_track_identifier"))]
    pub identifier: String,
    /// Source URL the node loads.
    #[validate(url)]
    pub uri: String,
    /// Display title.
    #[validate(length(min = 1, max = 256))]
    pub title: String,
    /// Track length in milliseconds.
    pub duration_ms: u64,
    /// User who asked for the track.
    #[serde(default)]
    #[validate(nested)]
    pub requester: Option<RequesterInput>,
}

/// User who requested a track.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct RequesterInput {
    /// User snowflake.
    #[validate(custom(function = "validate_snowflake"))]
    pub user_id: u64,
    /// Name shown next to the track.
    #[validate(length(min = 1, max = 100))]
    pub display_name: String,
}

/// Playback command addressed to one guild's session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandRequest {
    /// Enqueue a track and start playback when idle. Without a track, resumes the queue.
    Play {
        /// Track to append.
        #[serde(default)]
        track: Option<TrackInput>,
        /// Voice channel to join when playback starts.
        #[serde(default)]
        voice_channel_id: Option<u64>,
    },
    /// Play a track immediately, keeping the rest of the queue.
    PlayNow {
        /// Track to play.
        track: TrackInput,
        /// Voice channel to join when playback starts.
        #[serde(default)]
        voice_channel_id: Option<u64>,
    },
    /// Pause playback.
    Pause,
    /// Resume paused playback.
    Resume,
    /// Skip to the next track.
    Skip,
    /// Go back to the previous track.
    Previous,
    /// Make the track at a play-order position current.
    JumpTo {
        /// Play-order position.
        index: usize,
    },
    /// Remove the track at a play-order position.
    Remove {
        /// Play-order position.
        index: usize,
    },
    /// Change the repeat mode.
    SetMode {
        /// New repeat mode.
        mode: RepeatModeDto,
    },
    /// Shuffle the upcoming tracks.
    Shuffle,
    /// Restore enqueue order.
    Unshuffle,
    /// Stop playback and release the node, keeping the queue.
    StopKeepQueue,
    /// Stop playback, release the node and empty the queue.
    StopClearQueue,
    /// Leave voice and discard the session.
    Leave,
}

impl Validate for CommandRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let (track, voice_channel_id) = match self {
            CommandRequest::Play {
                track,
                voice_channel_id,
            } => (track.as_ref(), *voice_channel_id),
            CommandRequest::PlayNow {
                track,
                voice_channel_id,
            } => (Some(track), *voice_channel_id),
            _ => (None, None),
        };

        if let Some(track) = track {
            if let Err(track_errors) = track.validate() {
                errors.merge_self("track", Err(track_errors));
            }
        }

        if let Some(channel) = voice_channel_id {
            if let Err(e) = validate_snowflake(&channel) {
                errors.add("voice_channel_id", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl From<TrackInput> for Track {
    fn from(input: TrackInput) -> Self {
        Self {
            identifier: input.identifier,
            uri: input.uri,
            title: input.title,
            duration_ms: input.duration_ms,
            requester: input.requester.map(|requester| Requester {
                user_id: requester.user_id,
                display_name: requester.display_name,
            }),
        }
    }
}

impl From<CommandRequest> for Command {
    fn from(request: CommandRequest) -> Self {
        match request {
            CommandRequest::Play {
                track,
                voice_channel_id,
            } => Command::Play {
                track: track.map(Track::from),
                voice_channel_id,
            },
            CommandRequest::PlayNow {
                track,
                voice_channel_id,
            } => Command::PlayNow {
                track: track.into(),
                voice_channel_id,
            },
            CommandRequest::Pause => Command::Pause,
            CommandRequest::Resume => Command::Resume,
            CommandRequest::Skip => Command::Skip,
            CommandRequest::Previous => Command::Previous,
            CommandRequest::JumpTo { index } => Command::JumpTo(index),
            CommandRequest::Remove { index } => Command::Remove(index),
            CommandRequest::SetMode { mode } => Command::SetMode(mode.into()),
            CommandRequest::Shuffle => Command::Shuffle,
            CommandRequest::Unshuffle => Command::Unshuffle,
            CommandRequest::StopKeepQueue => Command::StopKeepQueue,
            CommandRequest::StopClearQueue => Command::StopClearQueue,
            CommandRequest::Leave => Command::Leave,
        }
    }
}

/// Category of a rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The request failed validation.
    Validation,
    /// The command does not apply in the session's phase.
    InvalidState,
    /// No such session or queue position.
    NotFound,
    /// No audio node could be assigned.
    SessionUnavailable,
    /// Another replica owns the session.
    Conflict,
    /// The snapshot store is unavailable.
    Degraded,
    /// The session did not answer in time.
    Timeout,
}

/// Outcome of a submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResult {
    /// The command was applied; the session after applying it.
    Accepted {
        /// Session after the command.
        session: SessionView,
    },
    /// The command was refused and nothing changed.
    Rejected {
        /// Error category.
        kind: RejectionKind,
        /// Human-readable explanation.
        reason: String,
    },
}

impl CommandResult {
    /// Whether the command was applied.
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandResult::Accepted { .. })
    }
}

impl From<Result<SessionView, ServiceError>> for CommandResult {
    fn from(result: Result<SessionView, ServiceError>) -> Self {
        match result {
            Ok(session) => CommandResult::Accepted { session },
            Err(err) => CommandResult::Rejected {
                kind: err.rejection_kind(),
                reason: err.to_string(),
            },
        }
    }
}
