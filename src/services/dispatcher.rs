//! Entry point of the command surface: validates commands and routes them to the guild's
//! session actor.

use std::time::Duration;

use tokio::{sync::oneshot, time::timeout};
use tracing::debug;
use validator::Validate;

use crate::{
    dto::{
        command::{CommandRequest, CommandResult},
        session::SessionView,
    },
    error::ServiceError,
    services::session_actor,
    state::{
        SharedState,
        node_pool::GuildId,
        registry::SessionHandle,
        session::{Command, SessionInput},
    },
};

/// Slack on top of the node acquisition budget before a caller stops waiting.
const REPLY_GRACE: Duration = Duration::from_secs(5);
/// A command is resent once when its actor exits before answering.
const SEND_ATTEMPTS: u32 = 2;

/// Validate and execute a command, folding the outcome into a [`CommandResult`].
pub async fn submit_command(
    state: &SharedState,
    guild_id: GuildId,
    request: CommandRequest,
) -> CommandResult {
    execute(state, guild_id, request).await.into()
}

/// Validate a command and run it on the guild's session.
///
/// Invalid payloads are rejected before any session is touched.
pub async fn execute(
    state: &SharedState,
    guild_id: GuildId,
    request: CommandRequest,
) -> Result<SessionView, ServiceError> {
    request.validate()?;
    execute_command(state, guild_id, Command::from(request)).await
}

/// Run an already validated command on the guild's session, starting it when needed.
pub async fn execute_command(
    state: &SharedState,
    guild_id: GuildId,
    command: Command,
) -> Result<SessionView, ServiceError> {
    let limit = state.config().nodes.acquire_max_wait + REPLY_GRACE;

    for attempt in 1..=SEND_ATTEMPTS {
        let handle = session_actor::ensure_session(state, guild_id);
        let (reply, answer) = oneshot::channel();
        let input = SessionInput::Command {
            command: command.clone(),
            reply,
        };
        if handle.send(input).is_err() {
            debug!(guild_id, attempt, "session actor exited before accepting the command");
            continue;
        }

        match timeout(limit, answer).await {
            Ok(Ok(result)) => return result,
            Ok(Err(_)) => {
                debug!(guild_id, attempt, "session actor exited before answering");
            }
            Err(_) => return Err(ServiceError::Timeout),
        }
    }

    Err(ServiceError::SessionUnavailable(format!(
        "guild {guild_id} session kept shutting down"
    )))
}

/// Read the current state of a session running on this replica.
pub async fn inspect(state: &SharedState, guild_id: GuildId) -> Result<SessionView, ServiceError> {
    let handle = state
        .sessions()
        .get(guild_id)
        .ok_or_else(|| not_running(guild_id))?;
    inspect_handle(&handle, guild_id).await
}

/// Take a session over from the shared store and return its state.
///
/// A session already running here is returned as is. Otherwise the stored snapshot is
/// claimed, which makes its previous owner stand down on its next write.
pub async fn takeover(state: &SharedState, guild_id: GuildId) -> Result<SessionView, ServiceError> {
    if let Some(handle) = state.sessions().get(guild_id) {
        return inspect_handle(&handle, guild_id).await;
    }

    let store = state.require_snapshot_store().await?;
    if store.find_snapshot(guild_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!(
            "no stored session for guild {guild_id}"
        )));
    }

    let handle = session_actor::ensure_session(state, guild_id);
    inspect_handle(&handle, guild_id).await
}

async fn inspect_handle(handle: &SessionHandle, guild_id: GuildId) -> Result<SessionView, ServiceError> {
    let (reply, answer) = oneshot::channel();
    handle
        .send(SessionInput::Inspect { reply })
        .map_err(|_| not_running(guild_id))?;
    answer.await.map_err(|_| not_running(guild_id))
}

fn not_running(guild_id: GuildId) -> ServiceError {
    ServiceError::NotFound(format!("no session running for guild {guild_id}"))
}
