use tokio::sync::broadcast;

use crate::dto::sse::{ServerEvent, SessionNotification};

/// Fan-out of session notifications to SSE subscribers and in-process observers.
pub struct SessionHub {
    notifications: broadcast::Sender<SessionNotification>,
    system: broadcast::Sender<ServerEvent>,
}

impl SessionHub {
    /// Construct a hub backed by Tokio broadcast channels with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (notifications, _receiver) = broadcast::channel(capacity);
        let (system, _receiver) = broadcast::channel(capacity);
        Self {
            notifications,
            system,
        }
    }

    /// Register a new subscriber that will receive subsequent notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    /// Send a notification to all current subscribers, ignoring delivery errors.
    pub fn publish(&self, notification: SessionNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Register a subscriber for replica-wide status events.
    pub fn subscribe_system(&self) -> broadcast::Receiver<ServerEvent> {
        self.system.subscribe()
    }

    /// Send a replica-wide status event, ignoring delivery errors.
    pub fn broadcast_system(&self, event: ServerEvent) {
        let _ = self.system.send(event);
    }
}
