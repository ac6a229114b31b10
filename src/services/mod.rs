/// Command validation and routing to session actors.
pub mod dispatcher;
/// OpenAPI documentation generation.
pub mod documentation;
/// Node and gateway event routing.
pub mod event_bridge;
/// Health check service.
pub mod health_service;
/// Periodic audio node heartbeats.
pub mod node_monitor;
/// Per-guild session actors.
pub mod session_actor;
/// Session notification fan-out.
pub mod sse_events;
/// Server-Sent Events streaming service.
pub mod sse_service;
/// Snapshot store reconnection and degraded mode.
pub mod storage_supervisor;
/// Snapshot persistence, takeover and recovery.
pub mod synchronizer;
