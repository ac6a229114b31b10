pub mod node_pool;
pub mod queue;
pub mod registry;
pub mod session;
pub mod session_machine;
mod sse;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, watch};

use crate::{
    clients::{gateway::VoiceGateway, node::NodeClient},
    config::AppConfig,
    dao::snapshot_store::SnapshotStore,
    error::ServiceError,
    state::node_pool::GuildId,
};

pub use self::sse::SessionHub;
use self::{node_pool::NodePool, registry::SessionRegistry};

/// Handle to the application state shared by routes, services and actors.
pub type SharedState = Arc<AppState>;

/// Capacity of the notification fan-out channels.
const NOTIFICATION_CAPACITY: usize = 256;

/// Central application state: configuration, node pool, session directory and the
/// snapshot store handle.
pub struct AppState {
    config: AppConfig,
    snapshot_store: RwLock<Option<Arc<dyn SnapshotStore>>>,
    degraded: watch::Sender<bool>,
    pending_discards: DashMap<GuildId, u64>,
    sessions: SessionRegistry,
    nodes: NodePool,
    node_client: Arc<dyn NodeClient>,
    gateway: Option<Arc<dyn VoiceGateway>>,
    hub: SessionHub,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a snapshot store is installed.
    pub fn new(
        config: AppConfig,
        node_client: Arc<dyn NodeClient>,
        gateway: Option<Arc<dyn VoiceGateway>>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let nodes = NodePool::new(
            config.node_descriptors(),
            config.nodes.unreachable_after_missed,
        );
        Arc::new(Self {
            config,
            snapshot_store: RwLock::new(None),
            degraded: degraded_tx,
            pending_discards: DashMap::new(),
            sessions: SessionRegistry::new(),
            nodes,
            node_client,
            gateway,
            hub: SessionHub::new(NOTIFICATION_CAPACITY),
        })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Identity of this replica.
    pub fn replica_id(&self) -> &str {
        &self.config.replica_id
    }

    /// Obtain a handle to the current snapshot store, if one is installed.
    pub async fn snapshot_store(&self) -> Option<Arc<dyn SnapshotStore>> {
        let guard = self.snapshot_store.read().await;
        guard.as_ref().cloned()
    }

    /// Snapshot store or [`ServiceError::Degraded`] when none is installed.
    pub async fn require_snapshot_store(&self) -> Result<Arc<dyn SnapshotStore>, ServiceError> {
        self.snapshot_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new snapshot store implementation and leave degraded mode.
    pub async fn install_snapshot_store(&self, store: Arc<dyn SnapshotStore>) {
        {
            let mut guard = self.snapshot_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current snapshot store and enter degraded mode.
    pub async fn clear_snapshot_store(&self) {
        {
            let mut guard = self.snapshot_store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Snapshots of ended sessions waiting for the store to come back, keyed by guild
    /// with the revision to delete up to.
    pub fn pending_discards(&self) -> &DashMap<GuildId, u64> {
        &self.pending_discards
    }

    /// Live session actors on this replica.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Audio node pool.
    pub fn nodes(&self) -> &NodePool {
        &self.nodes
    }

    /// Client used for every audio node request.
    pub fn node_client(&self) -> Arc<dyn NodeClient> {
        self.node_client.clone()
    }

    /// Voice gateway, when one is configured.
    pub fn gateway(&self) -> Option<Arc<dyn VoiceGateway>> {
        self.gateway.clone()
    }

    /// Notification fan-out used by SSE streams.
    pub fn notifications(&self) -> &SessionHub {
        &self.hub
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }
}
