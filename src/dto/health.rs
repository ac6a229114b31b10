use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Identity of the answering replica.
    pub replica_id: String,
    /// Sessions currently owned by this replica.
    pub sessions: usize,
    /// Audio nodes currently accepting sessions.
    pub healthy_nodes: usize,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(replica_id: String, sessions: usize, healthy_nodes: usize) -> Self {
        Self {
            status: "ok".to_string(),
            replica_id,
            sessions,
            healthy_nodes,
        }
    }

    /// Create a health response indicating the system runs without its snapshot store.
    pub fn degraded(replica_id: String, sessions: usize, healthy_nodes: usize) -> Self {
        Self {
            status: "degraded".to_string(),
            replica_id,
            sessions,
            healthy_nodes,
        }
    }
}
