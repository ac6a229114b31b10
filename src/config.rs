//! Application-level configuration loading: replica identity, session policy, audio nodes
//! and the voice gateway.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::node_pool::NodeDescriptor;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "GAMMA_TUNES_CONFIG_PATH";
/// Environment variable naming this replica when the file does not.
const REPLICA_ID_ENV: &str = "REPLICA_ID";

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Identity written into every snapshot this replica owns.
    pub replica_id: String,
    /// Session lifecycle policy.
    pub session: SessionConfig,
    /// Audio node pool policy and members.
    pub nodes: NodesConfig,
    /// Voice gateway location.
    pub gateway: GatewayConfig,
}

/// Session lifecycle thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time without activity (or with an empty voice channel) before a session terminates.
    pub idle_timeout: Duration,
    /// Consecutive track failures that abort playback.
    pub max_consecutive_track_failures: u32,
    /// Attempts at claiming a snapshot before giving up on a takeover.
    pub snapshot_claim_attempts: u32,
}

/// Node pool thresholds and membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesConfig {
    /// Interval between heartbeat rounds.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats that make a node unreachable.
    pub unreachable_after_missed: u32,
    /// First delay between acquisition attempts.
    pub acquire_initial_backoff: Duration,
    /// Upper bound of the acquisition backoff.
    pub acquire_max_backoff: Duration,
    /// Total time an acquisition may take before the session gives up.
    pub acquire_max_wait: Duration,
    /// Known nodes.
    pub members: Vec<NodeMember>,
}

/// One configured audio node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeMember {
    /// Stable node identifier.
    pub id: String,
    /// Base URL of the node.
    pub address: String,
    /// Maximum concurrent sessions.
    pub capacity: usize,
    /// Shared secret, if the node requires one.
    #[serde(default)]
    pub password: Option<String>,
}

/// Voice gateway settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Base URL of the gateway sidecar. Voice join/leave calls are skipped when absent.
    pub base_url: Option<String>,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        replica_id = %app_config.replica_id,
                        nodes = app_config.nodes.members.len(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Node descriptors for the pool, all starting healthy and unloaded.
    pub fn node_descriptors(&self) -> Vec<NodeDescriptor> {
        self.nodes
            .members
            .iter()
            .map(|member| {
                NodeDescriptor::new(
                    member.id.clone(),
                    member.address.clone(),
                    member.capacity,
                    member.password.clone(),
                )
            })
            .collect()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        RawSessionConfig::default().into()
    }
}

impl Default for NodesConfig {
    fn default() -> Self {
        RawNodesConfig::default().into()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    replica_id: Option<String>,
    session: RawSessionConfig,
    nodes: RawNodesConfig,
    gateway: RawGatewayConfig,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawSessionConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    idle_timeout_ms: Duration,
    max_consecutive_track_failures: u32,
    snapshot_claim_attempts: u32,
}

impl Default for RawSessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: Duration::from_secs(300),
            max_consecutive_track_failures: 3,
            snapshot_claim_attempts: 3,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawNodesConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    heartbeat_interval_ms: Duration,
    unreachable_after_missed: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    acquire_initial_backoff_ms: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    acquire_max_backoff_ms: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    acquire_max_wait_ms: Duration,
    members: Vec<NodeMember>,
}

impl Default for RawNodesConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: Duration::from_secs(5),
            unreachable_after_missed: 3,
            acquire_initial_backoff_ms: Duration::from_millis(250),
            acquire_max_backoff_ms: Duration::from_secs(4),
            acquire_max_wait_ms: Duration::from_secs(15),
            members: vec![NodeMember {
                id: "local".into(),
                address: "http://localhost:2333".into(),
                capacity: 50,
                password: None,
            }],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGatewayConfig {
    base_url: Option<String>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let replica_id = value
            .replica_id
            .filter(|id| !id.is_empty())
            .or_else(|| env::var(REPLICA_ID_ENV).ok().filter(|id| !id.is_empty()))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        Self {
            replica_id,
            session: value.session.into(),
            nodes: value.nodes.into(),
            gateway: GatewayConfig {
                base_url: value.gateway.base_url.filter(|url| !url.is_empty()),
            },
        }
    }
}

impl From<RawSessionConfig> for SessionConfig {
    fn from(value: RawSessionConfig) -> Self {
        Self {
            idle_timeout: value.idle_timeout_ms,
            max_consecutive_track_failures: value.max_consecutive_track_failures.max(1),
            snapshot_claim_attempts: value.snapshot_claim_attempts.max(1),
        }
    }
}

impl From<RawNodesConfig> for NodesConfig {
    fn from(value: RawNodesConfig) -> Self {
        Self {
            heartbeat_interval: value.heartbeat_interval_ms,
            unreachable_after_missed: value.unreachable_after_missed.max(1),
            acquire_initial_backoff: value.acquire_initial_backoff_ms,
            acquire_max_backoff: value.acquire_max_backoff_ms.max(value.acquire_initial_backoff_ms),
            acquire_max_wait: value.acquire_max_wait_ms,
            members: value.members,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "replica_id": "replica-7",
                "session": { "idle_timeout_ms": 1500 },
                "nodes": {
                    "acquire_max_wait_ms": 2000,
                    "members": [
                        { "id": "eu-1", "address": "http://eu-1:2333", "capacity": 10, "password": "s3cret" }
                    ]
                }
            }"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.replica_id, "replica-7");
        assert_eq!(config.session.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.session.max_consecutive_track_failures, 3);
        assert_eq!(config.nodes.acquire_max_wait, Duration::from_secs(2));
        assert_eq!(config.nodes.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.gateway.base_url, None);

        let descriptors = config.node_descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].id, "eu-1");
        assert_eq!(descriptors[0].password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn thresholds_are_clamped_to_usable_values() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "session": { "max_consecutive_track_failures": 0 },
                "nodes": { "unreachable_after_missed": 0, "acquire_initial_backoff_ms": 500, "acquire_max_backoff_ms": 100 }
            }"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.session.max_consecutive_track_failures, 1);
        assert_eq!(config.nodes.unreachable_after_missed, 1);
        assert_eq!(config.nodes.acquire_max_backoff, Duration::from_millis(500));
    }

    #[test]
    fn replica_id_is_generated_when_missing() {
        let config = AppConfig::default();
        assert!(!config.replica_id.is_empty());
    }
}
