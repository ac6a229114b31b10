use tracing::warn;

use crate::{
    dto::health::HealthResponse,
    state::{SharedState, node_pool::NodeHealth},
};

/// Report replica health while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_snapshot_store().await {
        Ok(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "snapshot store health check failed");
            }
        }
        Err(_) => warn!("snapshot store unavailable (degraded mode)"),
    }

    let replica_id = state.replica_id().to_owned();
    let sessions = state.sessions().len();
    let healthy_nodes = state
        .nodes()
        .snapshot()
        .values()
        .filter(|node| node.health == NodeHealth::Healthy)
        .count();

    if state.is_degraded() {
        HealthResponse::degraded(replica_id, sessions, healthy_nodes)
    } else {
        HealthResponse::ok(replica_id, sessions, healthy_nodes)
    }
}
