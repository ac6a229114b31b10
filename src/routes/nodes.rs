use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use crate::{
    dto::{
        events::{GatewayEventPayload, NodeEventPayload},
        node::NodeView,
    },
    error::AppError,
    services::event_bridge,
    state::SharedState,
};

/// Routes exposing the node pool and receiving collaborator events.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/{node_id}/events", post(node_event))
        .route("/gateway/events", post(gateway_event))
}

/// Audio nodes known to this replica with their health and load.
#[utoipa::path(
    get,
    path = "/nodes",
    tag = "nodes",
    responses((status = 200, description = "Node pool", body = [NodeView]))
)]
pub async fn list_nodes(State(state): State<SharedState>) -> Json<Vec<NodeView>> {
    let nodes = state.nodes().snapshot();
    Json(nodes.values().map(NodeView::from).collect())
}

/// Receive a player or node event from an audio node.
#[utoipa::path(
    post,
    path = "/nodes/{node_id}/events",
    tag = "nodes",
    params(("node_id" = String, Path, description = "Node that produced the event")),
    request_body = NodeEventPayload,
    responses(
        (status = 202, description = "Event accepted"),
        (status = 404, description = "Unknown node")
    )
)]
pub async fn node_event(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
    Json(payload): Json<NodeEventPayload>,
) -> Result<StatusCode, AppError> {
    event_bridge::handle_node_event(&state, &node_id, payload)?;
    Ok(StatusCode::ACCEPTED)
}

/// Receive a voice membership event from the gateway.
#[utoipa::path(
    post,
    path = "/gateway/events",
    tag = "nodes",
    request_body = GatewayEventPayload,
    responses((status = 202, description = "Event accepted"))
)]
pub async fn gateway_event(
    State(state): State<SharedState>,
    Json(payload): Json<GatewayEventPayload>,
) -> StatusCode {
    event_bridge::handle_gateway_event(&state, payload);
    StatusCode::ACCEPTED
}
