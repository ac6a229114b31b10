//! Inbound asynchronous events pushed by audio nodes and the voice gateway.

use serde::Deserialize;
use utoipa::ToSchema;

use crate::state::session::{GatewayEvent, NodeEvent, TrackEndReason};

/// Reason attached to a `track_ended` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrackEndReasonDto {
    /// Played to the end.
    Finished,
    /// The node could not load the track.
    LoadFailed,
    /// Stopped on request.
    Stopped,
    /// Replaced by another play request.
    Replaced,
    /// The player was destroyed.
    Cleanup,
}

impl From<TrackEndReasonDto> for TrackEndReason {
    fn from(value: TrackEndReasonDto) -> Self {
        match value {
            TrackEndReasonDto::Finished => TrackEndReason::Finished,
            TrackEndReasonDto::LoadFailed => TrackEndReason::LoadFailed,
            TrackEndReasonDto::Stopped => TrackEndReason::Stopped,
            TrackEndReasonDto::Replaced => TrackEndReason::Replaced,
            TrackEndReasonDto::Cleanup => TrackEndReason::Cleanup,
        }
    }
}

/// Event posted by an audio node.
///
/// Every event names the guild it belongs to, except `node_disconnected` without a
/// guild, which reports the whole node as gone. Track events echo the `play_id` sent
/// with the play request when the node supports it.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEventPayload {
    /// A track began streaming.
    TrackStarted {
        /// Affected guild.
        guild_id: u64,
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to.
        #[serde(default)]
        play_id: Option<u64>,
    },
    /// A track stopped.
    TrackEnded {
        /// Affected guild.
        guild_id: u64,
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to.
        #[serde(default)]
        play_id: Option<u64>,
        /// Why it stopped.
        reason: TrackEndReasonDto,
    },
    /// Playback failed mid-track.
    TrackException {
        /// Affected guild.
        guild_id: u64,
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to.
        #[serde(default)]
        play_id: Option<u64>,
        /// Node-provided description.
        #[serde(default)]
        message: String,
    },
    /// The track produced no audio for too long.
    TrackStuck {
        /// Affected guild.
        guild_id: u64,
        /// Node-side identifier of the track.
        track_identifier: String,
        /// Play request the event belongs to.
        #[serde(default)]
        play_id: Option<u64>,
        /// Threshold that was exceeded.
        #[serde(default)]
        threshold_ms: u64,
    },
    /// Periodic position report.
    PlayerUpdate {
        /// Affected guild.
        guild_id: u64,
        /// Position within the current track.
        position_ms: u64,
    },
    /// The node dropped one guild's player, or every player when `guild_id` is absent.
    NodeDisconnected {
        /// Affected guild.
        #[serde(default)]
        guild_id: Option<u64>,
        /// Close code, if one was sent.
        #[serde(default)]
        code: Option<u16>,
        /// Close reason, if one was sent.
        #[serde(default)]
        reason: Option<String>,
    },
}

impl NodeEventPayload {
    /// Split into the addressed guild (if any) and the session-level event.
    pub fn into_parts(self) -> (Option<u64>, NodeEvent) {
        match self {
            NodeEventPayload::TrackStarted {
                guild_id,
                track_identifier,
                play_id,
            } => (
                Some(guild_id),
                NodeEvent::TrackStarted {
                    track_identifier,
                    play_id,
                },
            ),
            NodeEventPayload::TrackEnded {
                guild_id,
                track_identifier,
                play_id,
                reason,
            } => (
                Some(guild_id),
                NodeEvent::TrackEnded {
                    track_identifier,
                    play_id,
                    reason: reason.into(),
                },
            ),
            NodeEventPayload::TrackException {
                guild_id,
                track_identifier,
                play_id,
                message,
            } => (
                Some(guild_id),
                NodeEvent::TrackException {
                    track_identifier,
                    play_id,
                    message,
                },
            ),
            NodeEventPayload::TrackStuck {
                guild_id,
                track_identifier,
                play_id,
                threshold_ms,
            } => (
                Some(guild_id),
                NodeEvent::TrackStuck {
                    track_identifier,
                    play_id,
                    threshold_ms,
                },
            ),
            NodeEventPayload::PlayerUpdate {
                guild_id,
                position_ms,
            } => (Some(guild_id), NodeEvent::PlayerUpdate { position_ms }),
            NodeEventPayload::NodeDisconnected {
                guild_id,
                code,
                reason,
            } => (guild_id, NodeEvent::Disconnected { code, reason }),
        }
    }
}

/// Voice membership event posted by the gateway.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEventPayload {
    /// The last listener left the bot's voice channel.
    ChannelEmpty {
        /// Affected guild.
        guild_id: u64,
    },
    /// A listener joined the bot's voice channel again.
    ChannelOccupied {
        /// Affected guild.
        guild_id: u64,
    },
    /// The bot was removed from voice.
    ForcedDisconnect {
        /// Affected guild.
        guild_id: u64,
    },
}

impl GatewayEventPayload {
    /// Split into the addressed guild and the session-level event.
    pub fn into_parts(self) -> (u64, GatewayEvent) {
        match self {
            GatewayEventPayload::ChannelEmpty { guild_id } => (guild_id, GatewayEvent::ChannelEmpty),
            GatewayEventPayload::ChannelOccupied { guild_id } => {
                (guild_id, GatewayEvent::ChannelOccupied)
            }
            GatewayEventPayload::ForcedDisconnect { guild_id } => {
                (guild_id, GatewayEvent::ForcedDisconnect)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_events_carry_their_guild() {
        let payload: NodeEventPayload = serde_json::from_str(
            r#"{ "type": "track_ended", "guild_id": 12, "track_identifier": "abc", "play_id": 9, "reason": "load_failed" }"#,
        )
        .unwrap();
        let (guild, event) = payload.into_parts();
        assert_eq!(guild, Some(12));
        assert_eq!(
            event,
            NodeEvent::TrackEnded {
                track_identifier: "abc".into(),
                play_id: Some(9),
                reason: TrackEndReason::LoadFailed,
            }
        );
    }

    #[test]
    fn track_events_without_a_play_id_still_parse() {
        let payload: NodeEventPayload = serde_json::from_str(
            r#"{ "type": "track_started", "guild_id": 12, "track_identifier": "abc" }"#,
        )
        .unwrap();
        assert_eq!(
            payload.into_parts().1,
            NodeEvent::TrackStarted {
                track_identifier: "abc".into(),
                play_id: None,
            }
        );
    }

    #[test]
    fn node_wide_disconnect_has_no_guild() {
        let payload: NodeEventPayload =
            serde_json::from_str(r#"{ "type": "node_disconnected", "code": 4006 }"#).unwrap();
        let (guild, event) = payload.into_parts();
        assert_eq!(guild, None);
        assert_eq!(
            event,
            NodeEvent::Disconnected {
                code: Some(4006),
                reason: None,
            }
        );
    }

    #[test]
    fn gateway_events_deserialize() {
        let payload: GatewayEventPayload =
            serde_json::from_str(r#"{ "type": "channel_empty", "guild_id": 4 }"#).unwrap();
        assert_eq!(payload.into_parts(), (4, GatewayEvent::ChannelEmpty));
    }
}
