use serde::Serialize;
use utoipa::ToSchema;

use crate::state::node_pool::{NodeDescriptor, NodeHealth};

/// Health of an audio node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealthDto {
    /// Accepting sessions.
    Healthy,
    /// Missed a heartbeat or failed a request.
    Degraded,
    /// Missed too many heartbeats in a row.
    Unreachable,
}

impl From<NodeHealth> for NodeHealthDto {
    fn from(value: NodeHealth) -> Self {
        match value {
            NodeHealth::Healthy => NodeHealthDto::Healthy,
            NodeHealth::Degraded => NodeHealthDto::Degraded,
            NodeHealth::Unreachable => NodeHealthDto::Unreachable,
        }
    }
}

/// Audio node as listed by `GET /nodes`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NodeView {
    /// Configured node id.
    pub id: String,
    /// Base URL of the node.
    pub address: String,
    /// Current health.
    pub health: NodeHealthDto,
    /// Guilds bound to the node.
    pub load: usize,
    /// Maximum number of bound guilds.
    pub capacity: usize,
    /// Consecutive failed heartbeats.
    pub missed_heartbeats: u32,
}

impl From<&NodeDescriptor> for NodeView {
    fn from(node: &NodeDescriptor) -> Self {
        Self {
            id: node.id.clone(),
            address: node.address.clone(),
            health: node.health.into(),
            load: node.load,
            capacity: node.capacity,
            missed_heartbeats: node.missed_heartbeats,
        }
    }
}
