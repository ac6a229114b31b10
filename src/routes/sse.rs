use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
};
use axum_valid::Valid;
use futures::Stream;
use tracing::info;

use crate::{
    dto::command::GuildPath,
    services::sse_service::{self, StreamScope},
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/sse/sessions",
    tag = "sse",
    responses((status = 200, description = "Notifications of every session on this replica", content_type = "text/event-stream", body = String))
)]
/// Stream notifications of every session owned by this replica.
pub async fn sessions_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New sessions SSE connection");
    let subscription = sse_service::subscribe(&state, StreamScope::AllSessions);
    sse_service::to_sse_stream(subscription)
}

#[utoipa::path(
    get,
    path = "/sse/guilds/{guild_id}",
    tag = "sse",
    params(GuildPath),
    responses((status = 200, description = "Notifications of one guild's session", content_type = "text/event-stream", body = String))
)]
/// Stream notifications of a single guild's session.
pub async fn guild_stream(
    State(state): State<SharedState>,
    Valid(Path(path)): Valid<Path<GuildPath>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(guild_id = path.guild_id, "New guild SSE connection");
    let subscription = sse_service::subscribe(&state, StreamScope::Guild(path.guild_id));
    sse_service::to_sse_stream(subscription)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/sse/sessions", get(sessions_stream))
        .route("/sse/guilds/{guild_id}", get(guild_stream))
}
