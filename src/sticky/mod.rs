//! Sticky-session affinity cache
//!
//! Maps `(client IP, target host)` to a chosen backend for a TTL window so
//! that repeat connections land on the same server. The cache is a hint,
//! not a source of truth: every hit is revalidated against the current
//! state snapshot, and entries whose backend is missing, inactive, or not
//! `Up` are deleted on sight.
//!
//! Policy (mode, TTL, glob rules) is compiled once and swapped atomically
//! on settings updates; live entries survive a policy swap.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::state::{HealthStatus, StateSnapshot};

/// Cleanup sweep interval
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Sticky-session operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickyMode {
    /// Never pin
    #[default]
    Disabled,
    /// Pin every target
    Global,
    /// Pin targets matching the configured rules
    Conditional,
}

/// Sticky settings as carried by the `gateway` settings module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StickySettings {
    /// Operating mode
    #[serde(default)]
    pub sticky_session_mode: StickyMode,
    /// Record lifetime in seconds (0 disables pinning)
    #[serde(default)]
    pub sticky_session_ttl: u64,
    /// Host patterns for conditional mode (`*.example.com` globs or exact
    /// host names)
    #[serde(default)]
    pub sticky_rules: Vec<String>,
}

/// One pinned choice
#[derive(Debug, Clone)]
pub struct StickyRecord {
    /// The pinned backend id
    pub server_id: String,
    /// When the pin lapses (renewed on every valid hit)
    pub expires_at: Instant,
}

/// Cache key: client IP plus target host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StickyKey {
    /// Source address of the client connection
    pub client_ip: IpAddr,
    /// Sniffed target host
    pub target_host: String,
}

impl StickyKey {
    /// Build a key from a client address and target host
    #[must_use]
    pub fn new(client_ip: IpAddr, target_host: impl Into<String>) -> Self {
        Self {
            client_ip,
            target_host: target_host.into(),
        }
    }
}

/// Compiled sticky policy
struct Policy {
    mode: StickyMode,
    ttl: Duration,
    matchers: Vec<HostMatcher>,
}

enum HostMatcher {
    Exact(String),
    Glob(Regex),
}

impl HostMatcher {
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(exact) => host.eq_ignore_ascii_case(exact),
            Self::Glob(regex) => regex.is_match(host),
        }
    }
}

fn compile(settings: &StickySettings) -> Policy {
    let matchers = settings
        .sticky_rules
        .iter()
        .filter_map(|rule| {
            if rule.contains('*') {
                let pattern = format!(
                    "(?i)^{}$",
                    regex::escape(rule).replace("\\*", ".*")
                );
                match Regex::new(&pattern) {
                    Ok(regex) => Some(HostMatcher::Glob(regex)),
                    Err(e) => {
                        debug!(rule = %rule, error = %e, "Ignoring unparsable sticky rule");
                        None
                    }
                }
            } else {
                Some(HostMatcher::Exact(rule.to_ascii_lowercase()))
            }
        })
        .collect();

    Policy {
        mode: settings.sticky_session_mode,
        ttl: Duration::from_secs(settings.sticky_session_ttl),
        matchers,
    }
}

/// The sticky-session manager
pub struct StickyManager {
    cache: DashMap<StickyKey, StickyRecord>,
    policy: ArcSwap<Policy>,
}

impl StickyManager {
    /// Create a manager with the given initial settings
    #[must_use]
    pub fn new(settings: &StickySettings) -> Self {
        Self {
            cache: DashMap::new(),
            policy: ArcSwap::from_pointee(compile(settings)),
        }
    }

    /// Atomically replace the policy; cached pins survive the swap
    pub fn update_settings(&self, settings: &StickySettings) {
        self.policy.store(Arc::new(compile(settings)));
        debug!(
            mode = ?settings.sticky_session_mode,
            ttl = settings.sticky_session_ttl,
            rules = settings.sticky_rules.len(),
            "Sticky policy updated"
        );
    }

    /// Whether stickiness applies to `target_host` under the current policy
    #[must_use]
    pub fn should_apply(&self, target_host: &str) -> bool {
        let policy = self.policy.load();
        if policy.ttl.is_zero() {
            return false;
        }
        match policy.mode {
            StickyMode::Disabled => false,
            StickyMode::Global => true,
            StickyMode::Conditional => {
                policy.matchers.iter().any(|m| m.matches(target_host))
            }
        }
    }

    /// Look up a pin, revalidating it against `snapshot`.
    ///
    /// Expired entries, and entries whose backend is missing, inactive, or
    /// not `Up`, are deleted and miss. A valid hit renews the expiry.
    #[must_use]
    pub fn get(&self, key: &StickyKey, snapshot: &StateSnapshot) -> Option<StickyRecord> {
        let policy = self.policy.load();
        if policy.mode == StickyMode::Disabled || policy.ttl.is_zero() {
            return None;
        }

        let mut entry = self.cache.get_mut(key)?;

        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.cache.remove(key);
            return None;
        }

        let valid = snapshot
            .get(&entry.server_id)
            .is_some_and(|state| state.profile.active && state.health == HealthStatus::Up);
        if !valid {
            trace!(server_id = %entry.server_id, "Dropping sticky entry for unavailable backend");
            drop(entry);
            self.cache.remove(key);
            return None;
        }

        entry.expires_at = Instant::now() + policy.ttl;
        Some(entry.clone())
    }

    /// Pin `server_id` for `key` with a fresh expiry (no-op when disabled)
    pub fn set(&self, key: StickyKey, server_id: impl Into<String>) {
        let policy = self.policy.load();
        if policy.mode == StickyMode::Disabled || policy.ttl.is_zero() {
            return;
        }
        self.cache.insert(
            key,
            StickyRecord {
                server_id: server_id.into(),
                expires_at: Instant::now() + policy.ttl,
            },
        );
    }

    /// Unique client IPs currently pinned (feeds the recent-clients view)
    #[must_use]
    pub fn client_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.cache.iter().map(|e| e.key().client_ip).collect();
        ips.sort_unstable();
        ips.dedup();
        ips
    }

    /// Remove every expired record
    pub fn cleanup(&self) {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, record| record.expires_at > now);
        let removed = before.saturating_sub(self.cache.len());
        if removed > 0 {
            debug!(removed, "Sticky cleanup removed expired records");
        }
    }

    /// Number of cached pins
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Spawn the periodic cleanup task; it stops when the manager is dropped.
pub fn spawn_cleanup(manager: &Arc<StickyManager>) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.cleanup();
        }
    })
}
