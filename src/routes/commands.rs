use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::{
        command::{CommandRequest, CommandResult, GuildPath, RejectionKind},
        session::SessionView,
    },
    error::AppError,
    services::dispatcher,
    state::SharedState,
};

/// Routes of the playback command surface.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/guilds", get(list_sessions))
        .route("/guilds/{guild_id}", get(get_session))
        .route("/guilds/{guild_id}/commands", post(submit_command))
        .route("/guilds/{guild_id}/takeover", post(takeover))
}

fn rejection_status(kind: RejectionKind) -> StatusCode {
    match kind {
        RejectionKind::Validation => StatusCode::BAD_REQUEST,
        RejectionKind::InvalidState | RejectionKind::Conflict => StatusCode::CONFLICT,
        RejectionKind::NotFound => StatusCode::NOT_FOUND,
        RejectionKind::SessionUnavailable | RejectionKind::Degraded => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RejectionKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
    }
}

/// Apply a playback command to a guild's session, starting the session when needed.
#[utoipa::path(
    post,
    path = "/guilds/{guild_id}/commands",
    tag = "sessions",
    params(GuildPath),
    request_body = CommandRequest,
    responses(
        (status = 200, description = "Command applied", body = CommandResult),
        (status = 400, description = "Invalid command", body = CommandResult),
        (status = 409, description = "Command not applicable in the current state", body = CommandResult),
        (status = 503, description = "No node or session available", body = CommandResult)
    )
)]
pub async fn submit_command(
    State(state): State<SharedState>,
    Valid(Path(path)): Valid<Path<GuildPath>>,
    Json(payload): Json<CommandRequest>,
) -> (StatusCode, Json<CommandResult>) {
    let result = dispatcher::submit_command(&state, path.guild_id, payload).await;
    let status = match &result {
        CommandResult::Accepted { .. } => StatusCode::OK,
        CommandResult::Rejected { kind, .. } => rejection_status(*kind),
    };
    (status, Json(result))
}

/// Sessions currently running on this replica.
#[utoipa::path(
    get,
    path = "/guilds",
    tag = "sessions",
    responses((status = 200, description = "Running sessions", body = [SessionView]))
)]
pub async fn list_sessions(State(state): State<SharedState>) -> Json<Vec<SessionView>> {
    let mut sessions = Vec::new();
    for guild_id in state.sessions().guild_ids() {
        if let Ok(view) = dispatcher::inspect(&state, guild_id).await {
            sessions.push(view);
        }
    }
    Json(sessions)
}

/// Current state of a guild's session on this replica.
#[utoipa::path(
    get,
    path = "/guilds/{guild_id}",
    tag = "sessions",
    params(GuildPath),
    responses(
        (status = 200, description = "Session state", body = SessionView),
        (status = 404, description = "No session running for the guild")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Valid(Path(path)): Valid<Path<GuildPath>>,
) -> Result<Json<SessionView>, AppError> {
    let view = dispatcher::inspect(&state, path.guild_id).await?;
    Ok(Json(view))
}

/// Claim a stored session for this replica and resume it.
#[utoipa::path(
    post,
    path = "/guilds/{guild_id}/takeover",
    tag = "sessions",
    params(GuildPath),
    responses(
        (status = 200, description = "Session now owned by this replica", body = SessionView),
        (status = 404, description = "No stored session for the guild"),
        (status = 503, description = "Snapshot store unavailable")
    )
)]
pub async fn takeover(
    State(state): State<SharedState>,
    Valid(Path(path)): Valid<Path<GuildPath>>,
) -> Result<Json<SessionView>, AppError> {
    let view = dispatcher::takeover(&state, path.guild_id).await?;
    Ok(Json(view))
}
