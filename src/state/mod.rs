//! Server profiles, runtime state, and the published-state double buffer
//!
//! The store keeps two views of the backend set:
//!
//! - **A-zone** (`config`): the authoritative, mutable map. The controller
//!   and the health checker take its async write lock for configuration
//!   changes, instance lifecycle, and health updates.
//! - **B-zone** (`work`): an immutable snapshot behind an atomic pointer.
//!   Dispatch reads load the pointer lock-free and may hold the `Arc` for
//!   the duration of one decision.
//!
//! `publish()` copies A into a fresh map and swaps the pointer: readers
//! that loaded before the swap keep the old map, readers after see the new
//! one, and there is no partial visibility in between. Profile and
//! instance handles are shared by `Arc` (immutable per snapshot); health
//! and metrics are copied by value.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::strategy::TunnelStrategy;

/// Static configuration of one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Stable opaque identifier (UUID, assigned on first load if absent)
    #[serde(default)]
    pub id: String,

    /// Human label
    #[serde(default)]
    pub remarks: String,

    /// Strategy type: `multiplexed` or `per-request`
    #[serde(rename = "type")]
    pub kind: String,

    /// Remote hostname
    pub address: String,

    /// Remote port
    pub port: u16,

    /// Transport scheme: `ws` or `wss`
    pub scheme: String,

    /// WebSocket upgrade path
    #[serde(default = "default_path")]
    pub path: String,

    /// Connect-time host override (SNI/Host stay on `address`)
    #[serde(default)]
    pub edge_ip: String,

    /// Local listener port hint (0 = ephemeral)
    #[serde(default)]
    pub local_port: u16,

    /// Desired state
    #[serde(default)]
    pub active: bool,

    /// Strategy-specific network hint
    #[serde(default)]
    pub network: String,

    /// Per-profile cipher key id; falls back to the app-level key
    #[serde(default)]
    pub crypt_key_id: Option<u32>,
}

fn default_path() -> String {
    "/".to_string()
}

impl ServerProfile {
    /// Validate the fields the strategies depend on.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err(format!("profile '{}' has an empty address", self.remarks));
        }
        if self.port == 0 {
            return Err(format!("profile '{}' has port 0", self.remarks));
        }
        match self.scheme.as_str() {
            "ws" | "wss" => {}
            other => {
                return Err(format!(
                    "profile '{}' has unsupported scheme '{other}'",
                    self.remarks
                ));
            }
        }
        Ok(())
    }
}

/// Health check state of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not probed yet
    #[default]
    Unknown,
    /// Last probe succeeded
    Up,
    /// Last probe failed
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Runtime performance numbers for one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Live local connections through this backend's listener
    pub active_connections: i64,
    /// Last probe latency in milliseconds (-1 = unknown)
    pub latency_ms: i64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            active_connections: -1,
            latency_ms: -1,
        }
    }
}

/// Runtime pairing of a profile with its strategy instance and health
///
/// Invariants maintained by the controller:
/// - `instance` present ⇒ `profile.active` and the listener is bound
/// - `profile.active == false` ⇒ `instance` is absent
#[derive(Clone)]
pub struct ServerState {
    /// Owned profile snapshot
    pub profile: Arc<ServerProfile>,
    /// Strategy handle when active
    pub instance: Option<Arc<dyn TunnelStrategy>>,
    /// Probe state
    pub health: HealthStatus,
    /// Probe metrics
    pub metrics: Metrics,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("id", &self.profile.id)
            .field("remarks", &self.profile.remarks)
            .field("active", &self.profile.active)
            .field("instance", &self.instance.is_some())
            .field("health", &self.health)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl ServerState {
    /// Create the initial state for a freshly loaded profile
    #[must_use]
    pub fn new(profile: Arc<ServerProfile>) -> Self {
        Self {
            profile,
            instance: None,
            health: HealthStatus::Unknown,
            metrics: Metrics::default(),
        }
    }

    /// Whether dispatch may route new connections here
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.profile.active
            && self.health == HealthStatus::Up
            && self
                .instance
                .as_ref()
                .is_some_and(|i| i.listen_addr().is_some())
    }
}

/// Published, read-only view of all backends
pub type StateSnapshot = HashMap<String, ServerState>;

/// Source of the dispatcher's state snapshots
pub trait StateProvider: Send + Sync {
    /// Load the current published snapshot (B-zone)
    fn server_states(&self) -> Arc<StateSnapshot>;
}

/// Feedback entry points for connection outcomes
pub trait FailureReporter: Send + Sync {
    /// Record a failed attempt against a backend
    fn report_failure(&self, server_id: &str);
    /// Record a successful attempt (resets the failure counter)
    fn report_success(&self, server_id: &str);
}

/// Double-buffered state store (A-zone / B-zone)
pub struct StateStore {
    /// A-zone: authoritative, mutated under the write lock
    config: RwLock<StateSnapshot>,
    /// B-zone: published snapshot, swapped atomically
    work: ArcSwap<StateSnapshot>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an empty store with an empty published snapshot
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RwLock::new(HashMap::new()),
            work: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Read access to the A-zone
    pub async fn config_state(&self) -> RwLockReadGuard<'_, StateSnapshot> {
        self.config.read().await
    }

    /// Write access to the A-zone
    pub async fn config_state_mut(&self) -> RwLockWriteGuard<'_, StateSnapshot> {
        self.config.write().await
    }

    /// Publish the A-zone into the B-zone.
    ///
    /// Takes the A read lock only long enough to clone the map, then swaps
    /// the published pointer. In-flight snapshot holders keep the old map.
    pub async fn publish(&self) {
        let snapshot = {
            let config = self.config.read().await;
            config.clone()
        };
        tracing::debug!(servers = snapshot.len(), "Publishing state snapshot");
        self.work.store(Arc::new(snapshot));
    }

    /// Load the published snapshot (lock-free)
    #[must_use]
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.work.load_full()
    }
}

impl StateProvider for StateStore {
    fn server_states(&self) -> Arc<StateSnapshot> {
        self.snapshot()
    }
}
