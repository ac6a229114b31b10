use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::{
    dto::sse::{Handshake, ServerEvent, SessionNotification},
    services::sse_events,
    state::{SharedState, node_pool::GuildId},
};

const EVENT_HANDSHAKE: &str = "handshake";

/// Which notifications a stream forwards.
#[derive(Clone, Copy, Debug)]
pub enum StreamScope {
    /// Every session owned by this replica.
    AllSessions,
    /// A single guild.
    Guild(GuildId),
}

impl StreamScope {
    fn label(&self) -> String {
        match self {
            StreamScope::AllSessions => "sessions".to_string(),
            StreamScope::Guild(guild_id) => format!("guild:{guild_id}"),
        }
    }

    fn accepts(&self, notification: &SessionNotification) -> bool {
        match self {
            StreamScope::AllSessions => true,
            StreamScope::Guild(guild_id) => notification.guild_id() == *guild_id,
        }
    }
}

/// Subscriptions backing one SSE client.
pub struct Subscription {
    scope: StreamScope,
    notifications: broadcast::Receiver<SessionNotification>,
    system: broadcast::Receiver<ServerEvent>,
    handshake: Option<ServerEvent>,
}

/// Subscribe to session notifications within `scope`.
pub fn subscribe(state: &SharedState, scope: StreamScope) -> Subscription {
    let handshake = Handshake {
        stream: scope.label(),
        message: "subscribed to session notifications".to_string(),
        degraded: state.is_degraded(),
    };
    Subscription {
        scope,
        notifications: state.notifications().subscribe(),
        system: state.notifications().subscribe_system(),
        handshake: ServerEvent::json(Some(EVENT_HANDSHAKE.to_string()), &handshake).ok(),
    }
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

/// Convert a subscription into an SSE response, forwarding events until the client
/// disconnects.
pub fn to_sse_stream(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let Subscription {
        scope,
        mut notifications,
        mut system,
        handshake,
    } = subscription;

    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        if let Some(handshake) = handshake {
            if tx.send(Ok(to_event(handshake))).await.is_err() {
                return;
            }
        }

        loop {
            let payload = tokio::select! {
                _ = tx.closed() => break,
                recv_result = notifications.recv() => match recv_result {
                    Ok(notification) if scope.accepts(&notification) => {
                        sse_events::to_server_event(&notification)
                    }
                    Ok(_) => None,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, stream = %scope.label(), "SSE subscriber lagged");
                        None
                    }
                },
                recv_result = system.recv() => match recv_result {
                    Ok(event) => Some(event),
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => None,
                },
            };

            if let Some(payload) = payload {
                if tx.send(Ok(to_event(payload))).await.is_err() {
                    break;
                }
            }
        }

        info!(stream = %scope.label(), "SSE stream disconnected");
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::sse::TerminationReason;

    #[test]
    fn guild_scope_filters_other_guilds() {
        let scope = StreamScope::Guild(4);
        let own = SessionNotification::Terminated {
            guild_id: 4,
            reason: TerminationReason::Left,
        };
        let other = SessionNotification::Terminated {
            guild_id: 5,
            reason: TerminationReason::Left,
        };
        assert!(scope.accepts(&own));
        assert!(!scope.accepts(&other));
        assert!(StreamScope::AllSessions.accepts(&other));
        assert_eq!(scope.label(), "guild:4");
    }
}
