//! Routes asynchronous node and gateway events into the owning session actor.

use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    dto::events::{GatewayEventPayload, NodeEventPayload},
    error::ServiceError,
    state::{
        SharedState,
        node_pool::{NodeHealth, PoolEvent},
        session::{NodeEvent, SessionInput},
    },
};

/// Forward an event reported by an audio node.
///
/// Events without a guild describe the node itself; a node-wide disconnect marks it
/// unreachable, which moves every session off it.
pub fn handle_node_event(
    state: &SharedState,
    node_id: &str,
    payload: NodeEventPayload,
) -> Result<(), ServiceError> {
    if state.nodes().descriptor(node_id).is_none() {
        return Err(ServiceError::NotFound(format!("unknown audio node `{node_id}`")));
    }

    let (guild_id, event) = payload.into_parts();
    let Some(guild_id) = guild_id else {
        if let NodeEvent::Disconnected { code, reason } = event {
            warn!(node_id, ?code, ?reason, "audio node disconnected");
            state.nodes().report_health(node_id, NodeHealth::Unreachable)?;
        }
        return Ok(());
    };

    match state.sessions().get(guild_id) {
        Some(handle) => {
            let input = SessionInput::Node {
                node_id: node_id.to_string(),
                event,
            };
            if handle.send(input).is_err() {
                debug!(guild_id, node_id, "session closed before the node event arrived");
            }
        }
        None => debug!(guild_id, node_id, "no session for node event; ignoring"),
    }
    Ok(())
}

/// Forward a voice membership event from the gateway.
pub fn handle_gateway_event(state: &SharedState, payload: GatewayEventPayload) {
    let (guild_id, event) = payload.into_parts();
    match state.sessions().get(guild_id) {
        Some(handle) => {
            if handle.send(SessionInput::Gateway(event)).is_err() {
                debug!(guild_id, "session closed before the gateway event arrived");
            }
        }
        None => debug!(guild_id, ?event, "no session for gateway event; ignoring"),
    }
}

/// Tell sessions when the pool drops their node.
pub fn spawn_reassignment_listener(state: SharedState) -> JoinHandle<()> {
    let mut events = state.nodes().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Reassign { node_id, guilds }) => {
                    info!(node_id = %node_id, sessions = guilds.len(), "reassigning sessions off unhealthy node");
                    for guild_id in guilds {
                        notify_reassign(&state, guild_id, &node_id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "reassignment listener lagged; sweeping all sessions");
                    sweep_unhealthy(&state);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn notify_reassign(state: &SharedState, guild_id: u64, node_id: &str) {
    if let Some(handle) = state.sessions().get(guild_id) {
        let _ = handle.send(SessionInput::Reassign {
            node_id: node_id.to_string(),
        });
    }
}

/// Send a reassignment for every unhealthy node to every session; sessions on healthy
/// nodes ignore them.
fn sweep_unhealthy(state: &SharedState) {
    let unhealthy: Vec<_> = state
        .nodes()
        .snapshot()
        .values()
        .filter(|node| node.health != NodeHealth::Healthy)
        .map(|node| node.id.clone())
        .collect();

    for guild_id in state.sessions().guild_ids() {
        for node_id in &unhealthy {
            notify_reassign(state, guild_id, node_id);
        }
    }
}
