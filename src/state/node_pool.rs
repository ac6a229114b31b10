//! Audio node registry: health, load and guild bindings.
//!
//! The node table is an immutable [`IndexMap`] behind an [`Arc`] published through a
//! [`watch`] channel. Every update clones the table, edits the copy and swaps it in while
//! holding the channel's write lock, so selection never observes a half-updated descriptor.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::clients::node::NodeClient;

/// Guild (server) identifier.
pub type GuildId = u64;
/// Audio node identifier.
pub type NodeId = String;

/// Health of an audio node as seen by this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// Eligible for new sessions.
    Healthy,
    /// Missed at least one heartbeat or reported failures.
    Degraded,
    /// Missed enough heartbeats to be considered gone.
    Unreachable,
}

/// Immutable description of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Stable node identifier.
    pub id: NodeId,
    /// Base URL of the node's REST interface.
    pub address: String,
    /// Shared secret sent with every request.
    pub password: Option<String>,
    /// Current health.
    pub health: NodeHealth,
    /// Number of sessions bound to the node.
    pub load: usize,
    /// Maximum number of sessions.
    pub capacity: usize,
    /// Consecutive failed heartbeats.
    pub missed_heartbeats: u32,
}

impl NodeDescriptor {
    /// Build a healthy, unloaded descriptor.
    pub fn new(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        capacity: usize,
        password: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            password,
            health: NodeHealth::Healthy,
            load: 0,
            capacity,
            missed_heartbeats: 0,
        }
    }

    fn accepts_sessions(&self) -> bool {
        self.health == NodeHealth::Healthy && self.load < self.capacity
    }
}

/// Notifications emitted by the pool. Sessions react to them; the pool never touches
/// session state itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A node left the healthy set and the listed guilds lost their binding.
    Reassign {
        /// Node that became unhealthy.
        node_id: NodeId,
        /// Guilds that were bound to it.
        guilds: Vec<GuildId>,
    },
}

/// Errors returned by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every healthy node is at capacity (or none is healthy).
    #[error("no audio node has capacity for a new session")]
    NoCapacity,
    /// The node id is not part of the pool.
    #[error("unknown audio node `{0}`")]
    UnknownNode(NodeId),
}

type NodeTable = Arc<IndexMap<NodeId, NodeDescriptor>>;

/// Node pool manager.
pub struct NodePool {
    table: watch::Sender<NodeTable>,
    bindings: DashMap<GuildId, NodeId>,
    events: broadcast::Sender<PoolEvent>,
    unreachable_after: u32,
}

impl NodePool {
    /// Create a pool from the configured nodes.
    ///
    /// `unreachable_after` is the number of consecutive missed heartbeats that promotes a
    /// node from degraded to unreachable.
    pub fn new(nodes: impl IntoIterator<Item = NodeDescriptor>, unreachable_after: u32) -> Self {
        let table = nodes
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect::<IndexMap<_, _>>();
        let (table, _rx) = watch::channel(Arc::new(table));
        let (events, _) = broadcast::channel(64);
        Self {
            table,
            bindings: DashMap::new(),
            events,
            unreachable_after: unreachable_after.max(1),
        }
    }

    /// Current node table.
    pub fn snapshot(&self) -> NodeTable {
        self.table.borrow().clone()
    }

    /// Descriptor of a single node.
    pub fn descriptor(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.table.borrow().get(node_id).cloned()
    }

    /// Node currently bound to a guild.
    pub fn bound_node(&self, guild_id: GuildId) -> Option<NodeId> {
        self.bindings.get(&guild_id).map(|entry| entry.value().clone())
    }

    /// Subscribe to reassignment notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Bind a guild to the least loaded healthy node.
    ///
    /// Ties are broken by node id. A healthy `hint` with spare capacity wins over the
    /// load ordering so a session can return to its previous node. Any previous binding of
    /// the guild is released first.
    pub fn acquire(
        &self,
        guild_id: GuildId,
        hint: Option<&str>,
    ) -> Result<NodeDescriptor, PoolError> {
        let mut outcome = Err(PoolError::NoCapacity);

        self.table.send_modify(|table| {
            let mut next = IndexMap::clone(table);

            if let Some((_, previous)) = self.bindings.remove(&guild_id) {
                if let Some(node) = next.get_mut(&previous) {
                    node.load = node.load.saturating_sub(1);
                }
            }

            let hinted = hint
                .and_then(|id| next.get(id))
                .filter(|node| node.accepts_sessions());
            let selected = hinted
                .or_else(|| {
                    next.values()
                        .filter(|node| node.accepts_sessions())
                        .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)))
                })
                .map(|node| node.id.clone());

            if let Some(node) = selected.as_deref().and_then(|id| next.get_mut(id)) {
                node.load += 1;
                self.bindings.insert(guild_id, node.id.clone());
                outcome = Ok(node.clone());
            }

            *table = Arc::new(next);
        });

        outcome
    }

    /// Drop a guild's binding. Returns the node it was bound to.
    pub fn release(&self, guild_id: GuildId) -> Option<NodeId> {
        let mut released = None;
        self.table.send_if_modified(|table| {
            let Some((_, node_id)) = self.bindings.remove(&guild_id) else {
                return false;
            };
            let mut next = IndexMap::clone(table);
            if let Some(node) = next.get_mut(&node_id) {
                node.load = node.load.saturating_sub(1);
            }
            *table = Arc::new(next);
            released = Some(node_id);
            true
        });
        released
    }

    /// Record a health observation for a node.
    ///
    /// Leaving the healthy state unbinds every guild on the node and emits
    /// [`PoolEvent::Reassign`] for them.
    pub fn report_health(&self, node_id: &str, health: NodeHealth) -> Result<(), PoolError> {
        self.update_node(node_id, |node| {
            node.health = health;
            if health == NodeHealth::Healthy {
                node.missed_heartbeats = 0;
            }
        })
    }

    /// Record the outcome of one heartbeat ping.
    ///
    /// The first miss degrades the node, reaching the configured threshold makes it
    /// unreachable, and any success restores it.
    pub fn record_heartbeat(&self, node_id: &str, ok: bool) -> Result<NodeHealth, PoolError> {
        let threshold = self.unreachable_after;
        let mut health = NodeHealth::Healthy;
        self.update_node(node_id, |node| {
            if ok {
                node.missed_heartbeats = 0;
                node.health = NodeHealth::Healthy;
            } else {
                node.missed_heartbeats = node.missed_heartbeats.saturating_add(1);
                node.health = if node.missed_heartbeats >= threshold {
                    NodeHealth::Unreachable
                } else {
                    NodeHealth::Degraded
                };
            }
            health = node.health;
        })?;
        Ok(health)
    }

    /// Ping every node once and record the results.
    pub async fn heartbeat(&self, client: &dyn NodeClient) {
        let nodes = self.snapshot();
        let pings = nodes.values().map(|node| {
            let node = node.clone();
            async move {
                let result = client.ping(node.clone()).await;
                (node, result)
            }
        });

        for (node, result) in join_all(pings).await {
            let ok = match result {
                Ok(()) => true,
                Err(err) => {
                    warn!(node_id = %node.id, error = %err, "node heartbeat failed");
                    false
                }
            };
            let _ = self.record_heartbeat(&node.id, ok);
        }
    }

    fn update_node<F>(&self, node_id: &str, edit: F) -> Result<(), PoolError>
    where
        F: FnOnce(&mut NodeDescriptor),
    {
        let mut outcome = Err(PoolError::UnknownNode(node_id.to_string()));
        let mut orphaned = Vec::new();

        self.table.send_if_modified(|table| {
            let mut next = IndexMap::clone(table);
            let Some(node) = next.get_mut(node_id) else {
                return false;
            };

            let before = node.clone();
            edit(node);
            outcome = Ok(());

            if node.health != NodeHealth::Healthy {
                self.bindings.retain(|guild, bound| {
                    if bound == node_id {
                        orphaned.push(*guild);
                        false
                    } else {
                        true
                    }
                });
                node.load = node.load.saturating_sub(orphaned.len());
            }

            if before.health != node.health {
                info!(
                    node_id,
                    from = ?before.health,
                    to = ?node.health,
                    "audio node health changed"
                );
            }

            let changed = *node != before;
            if changed {
                *table = Arc::new(next);
            }
            changed
        });

        if !orphaned.is_empty() {
            orphaned.sort_unstable();
            let _ = self.events.send(PoolEvent::Reassign {
                node_id: node_id.to_string(),
                guilds: orphaned,
            });
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(nodes: &[(&str, usize)]) -> NodePool {
        NodePool::new(
            nodes
                .iter()
                .map(|(id, capacity)| NodeDescriptor::new(*id, format!("http://{id}"), *capacity, None)),
            3,
        )
    }

    #[test]
    fn acquire_prefers_lowest_load_then_lowest_id() {
        let pool = pool(&[("node-b", 4), ("node-a", 4), ("node-c", 4)]);

        assert_eq!(pool.acquire(1, None).unwrap().id, "node-a");
        assert_eq!(pool.acquire(2, None).unwrap().id, "node-b");
        assert_eq!(pool.acquire(3, None).unwrap().id, "node-c");
        assert_eq!(pool.acquire(4, None).unwrap().id, "node-a");

        let table = pool.snapshot();
        assert_eq!(table["node-a"].load, 2);
        assert_eq!(table["node-b"].load, 1);
    }

    #[test]
    fn hint_wins_when_eligible() {
        let pool = pool(&[("node-a", 4), ("node-b", 4)]);
        pool.acquire(1, None).unwrap();

        assert_eq!(pool.acquire(2, Some("node-a")).unwrap().id, "node-a");
        assert_eq!(pool.acquire(3, Some("missing")).unwrap().id, "node-b");
    }

    #[test]
    fn acquire_fails_when_every_node_is_full() {
        let pool = pool(&[("node-a", 1)]);
        pool.acquire(1, None).unwrap();

        assert_eq!(pool.acquire(2, None), Err(PoolError::NoCapacity));
        assert_eq!(pool.bound_node(2), None);
    }

    #[test]
    fn reacquire_releases_the_previous_binding() {
        let pool = pool(&[("node-a", 1), ("node-b", 1)]);
        pool.acquire(1, None).unwrap();
        let second = pool.acquire(1, Some("node-b")).unwrap();

        assert_eq!(second.id, "node-b");
        assert_eq!(pool.snapshot()["node-a"].load, 0);
        assert_eq!(pool.bound_node(1).as_deref(), Some("node-b"));
    }

    #[test]
    fn release_frees_capacity() {
        let pool = pool(&[("node-a", 1)]);
        pool.acquire(1, None).unwrap();

        assert_eq!(pool.release(1).as_deref(), Some("node-a"));
        assert_eq!(pool.release(1), None);
        assert_eq!(pool.acquire(2, None).unwrap().id, "node-a");
    }

    #[test]
    fn unhealthy_node_unbinds_guilds_and_emits_reassignment() {
        let pool = pool(&[("node-a", 4), ("node-b", 4)]);
        let mut events = pool.subscribe();
        pool.acquire(7, Some("node-a")).unwrap();
        pool.acquire(3, Some("node-a")).unwrap();
        pool.acquire(9, Some("node-b")).unwrap();

        pool.report_health("node-a", NodeHealth::Unreachable).unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            PoolEvent::Reassign {
                node_id: "node-a".into(),
                guilds: vec![3, 7],
            }
        );
        assert_eq!(pool.bound_node(7), None);
        assert_eq!(pool.bound_node(9).as_deref(), Some("node-b"));
        assert_eq!(pool.snapshot()["node-a"].load, 0);
        assert_eq!(pool.acquire(7, Some("node-a")).unwrap().id, "node-b");
    }

    #[test]
    fn degraded_nodes_are_not_selected() {
        let pool = pool(&[("node-a", 4)]);
        pool.report_health("node-a", NodeHealth::Degraded).unwrap();

        assert_eq!(pool.acquire(1, None), Err(PoolError::NoCapacity));

        pool.report_health("node-a", NodeHealth::Healthy).unwrap();
        assert!(pool.acquire(1, None).is_ok());
    }

    #[test]
    fn heartbeat_misses_escalate_to_unreachable_and_recover() {
        let pool = pool(&[("node-a", 4)]);

        assert_eq!(pool.record_heartbeat("node-a", false), Ok(NodeHealth::Degraded));
        assert_eq!(pool.record_heartbeat("node-a", false), Ok(NodeHealth::Degraded));
        assert_eq!(pool.record_heartbeat("node-a", false), Ok(NodeHealth::Unreachable));
        assert_eq!(pool.acquire(1, None), Err(PoolError::NoCapacity));

        assert_eq!(pool.record_heartbeat("node-a", true), Ok(NodeHealth::Healthy));
        assert_eq!(pool.snapshot()["node-a"].missed_heartbeats, 0);
        assert!(pool.acquire(1, None).is_ok());
    }

    #[test]
    fn unknown_nodes_are_reported() {
        let pool = pool(&[("node-a", 4)]);
        assert_eq!(
            pool.report_health("ghost", NodeHealth::Healthy),
            Err(PoolError::UnknownNode("ghost".into()))
        );
    }

    #[test]
    fn old_snapshots_are_not_mutated_by_updates() {
        let pool = pool(&[("node-a", 4)]);
        let before = pool.snapshot();
        pool.acquire(1, None).unwrap();

        assert_eq!(before["node-a"].load, 0);
        assert_eq!(pool.snapshot()["node-a"].load, 1);
    }
}
