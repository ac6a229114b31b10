use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Gamma Tunes Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::sessions_stream,
        crate::routes::sse::guild_stream,
        crate::routes::commands::submit_command,
        crate::routes::commands::list_sessions,
        crate::routes::commands::get_session,
        crate::routes::commands::takeover,
        crate::routes::nodes::list_nodes,
        crate::routes::nodes::node_event,
        crate::routes::nodes::gateway_event,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::command::CommandRequest,
            crate::dto::command::CommandResult,
            crate::dto::command::RejectionKind,
            crate::dto::session::SessionView,
            crate::dto::node::NodeView,
            crate::dto::events::NodeEventPayload,
            crate::dto::events::GatewayEventPayload,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::SessionNotification,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "sessions", description = "Playback commands and session state"),
        (name = "nodes", description = "Audio node pool and collaborator events"),
    )
)]
/// OpenAPI document of the HTTP surface.
pub struct ApiDoc;
