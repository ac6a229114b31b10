use tracing::warn;

use crate::{
    dto::{
        session::{SessionView, TrackView},
        sse::{ServerEvent, SessionNotification, SystemStatus, TerminationReason},
    },
    state::{SharedState, node_pool::GuildId, queue::Track},
};

const EVENT_SYSTEM_STATUS: &str = "system.status";

/// Announce a new session revision.
pub fn broadcast_state_changed(state: &SharedState, session: SessionView) {
    state
        .notifications()
        .publish(SessionNotification::StateChanged { session });
}

/// Announce that a failed track was skipped.
pub fn broadcast_track_skipped(
    state: &SharedState,
    guild_id: GuildId,
    track: &Track,
    reason: String,
    consecutive_failures: u32,
) {
    state
        .notifications()
        .publish(SessionNotification::TrackSkipped {
            guild_id,
            track: TrackView::from(track),
            reason,
            consecutive_failures,
        });
}

/// Announce that playback was aborted after repeated track failures.
pub fn broadcast_fatal_queue_error(state: &SharedState, guild_id: GuildId, consecutive_failures: u32) {
    state
        .notifications()
        .publish(SessionNotification::FatalQueueError {
            guild_id,
            consecutive_failures,
        });
}

/// Announce that a migration gave up and playback stopped.
pub fn broadcast_playback_interrupted(state: &SharedState, guild_id: GuildId, reason: String) {
    state
        .notifications()
        .publish(SessionNotification::PlaybackInterrupted { guild_id, reason });
}

/// Announce the end of a session.
pub fn broadcast_terminated(state: &SharedState, guild_id: GuildId, reason: TerminationReason) {
    state
        .notifications()
        .publish(SessionNotification::Terminated { guild_id, reason });
}

/// Render a notification as an SSE event.
pub fn to_server_event(notification: &SessionNotification) -> Option<ServerEvent> {
    match ServerEvent::json(Some(notification.event_name().to_string()), notification) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "failed to serialize session notification");
            None
        }
    }
}

/// Forward degraded mode changes to every SSE subscriber until the state is dropped.
pub async fn announce_degraded_changes(state: SharedState) {
    let mut degraded = state.degraded_watcher();
    while degraded.changed().await.is_ok() {
        let payload = SystemStatus {
            degraded: *degraded.borrow_and_update(),
        };
        match ServerEvent::json(Some(EVENT_SYSTEM_STATUS.to_string()), &payload) {
            Ok(event) => state.notifications().broadcast_system(event),
            Err(err) => warn!(error = %err, "failed to serialize system status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{clients::fake::FakeNodeClient, config::AppConfig, state::AppState};

    #[tokio::test]
    async fn notifications_render_with_their_event_name() {
        let state = AppState::new(AppConfig::default(), Arc::new(FakeNodeClient::default()), None);
        let mut receiver = state.notifications().subscribe();

        broadcast_terminated(&state, 12, TerminationReason::IdleTimeout);

        let notification = receiver.recv().await.unwrap();
        assert_eq!(notification.guild_id(), 12);
        let event = to_server_event(&notification).unwrap();
        assert_eq!(event.event.as_deref(), Some("session.terminated"));
        assert!(event.data.contains("\"reason\":\"idle_timeout\""));
        assert!(event.data.contains("\"type\":\"terminated\""));
    }

    #[tokio::test]
    async fn degraded_changes_reach_system_subscribers() {
        let state = AppState::new(AppConfig::default(), Arc::new(FakeNodeClient::default()), None);
        let mut system = state.notifications().subscribe_system();
        tokio::spawn(announce_degraded_changes(state.clone()));
        tokio::task::yield_now().await;

        state.update_degraded(false);

        let event = system.recv().await.unwrap();
        assert_eq!(event.event.as_deref(), Some(EVENT_SYSTEM_STATUS));
        assert_eq!(event.data, r#"{"degraded":false}"#);
    }
}
