//! The dispatcher: rule evaluation, sticky pinning, backend selection
//!
//! One dispatch maps `(client address, sniffed target)` to a decision:
//! go direct, reject, or hand the connection to a backend's local
//! listener. The decision pipeline, in order:
//!
//! 1. evaluate the routing rules (first match wins)
//! 2. a rule naming a specific backend is honoured if that backend is
//!    eligible; otherwise selection falls through to the remaining
//!    candidates
//! 3. sticky lookup (only when stickiness applies to the target host)
//! 4. least-connections pick among eligible candidates, ties broken by
//!    lowest probe latency, then lexicographic id
//! 5. the pick is pinned for next time when stickiness applies
//!
//! Every dispatch runs against one published state snapshot; concurrent
//! configuration changes only affect later dispatches.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, trace};

use crate::error::DispatchError;
use crate::rules::{CompiledRuleSet, GeoIpResolver, NoGeoIp, RoutingSettings, RuleAction};
use crate::state::{ServerState, StateProvider, StateSnapshot};
use crate::sticky::{StickyKey, StickyManager, StickySettings};

/// Routing outcome for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Splice to the origin without a tunnel
    Direct,
    /// A backend was selected; forward to its local listener
    Backend {
        /// The strategy's bound loopback listener
        listen_addr: SocketAddr,
        /// The backend's id, for feedback reporting
        server_id: String,
    },
}

/// The routing decision engine
pub struct Dispatcher {
    state: Arc<dyn StateProvider>,
    sticky: Arc<StickyManager>,
    rules: ArcSwap<CompiledRuleSet>,
    geoip: Box<dyn GeoIpResolver>,
}

impl Dispatcher {
    /// Create a dispatcher over `state` with initial settings.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RuleCompile` if the initial routing rules
    /// do not compile.
    pub fn new(
        state: Arc<dyn StateProvider>,
        sticky_settings: &StickySettings,
        routing_settings: &RoutingSettings,
    ) -> Result<Self, DispatchError> {
        let rules = CompiledRuleSet::compile(routing_settings)?;
        Ok(Self {
            state,
            sticky: Arc::new(StickyManager::new(sticky_settings)),
            rules: ArcSwap::from_pointee(rules),
            geoip: Box::new(NoGeoIp),
        })
    }

    /// The sticky manager (shared with the cleanup task and the
    /// recent-clients view)
    #[must_use]
    pub fn sticky(&self) -> Arc<StickyManager> {
        Arc::clone(&self.sticky)
    }

    /// Atomically recompile the routing rules.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RuleCompile` and leaves the previous rules
    /// in place if compilation fails.
    pub fn update_routing(&self, settings: &RoutingSettings) -> Result<(), DispatchError> {
        let compiled = CompiledRuleSet::compile(settings)?;
        debug!(rules = compiled.len(), "Routing rules recompiled");
        self.rules.store(Arc::new(compiled));
        Ok(())
    }

    /// Swap the sticky policy
    pub fn update_gateway(&self, settings: &StickySettings) {
        self.sticky.update_settings(settings);
    }

    /// Decide how to route one connection.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` for reject rules and
    /// `DispatchError::NoBackend` when no eligible backend remains.
    pub fn dispatch(
        &self,
        client: SocketAddr,
        target_host: &str,
        target_port: u16,
    ) -> Result<Decision, DispatchError> {
        let snapshot = self.state.server_states();
        let rules = self.rules.load();

        let mut group: Option<Vec<String>> = None;
        match rules.evaluate(client.ip(), target_host, self.geoip.as_ref()) {
            Some(RuleAction::Direct) => {
                trace!(target = %target_host, "Rule decision: direct");
                return Ok(Decision::Direct);
            }
            Some(RuleAction::Reject) => {
                trace!(target = %target_host, "Rule decision: reject");
                return Err(DispatchError::Rejected);
            }
            Some(RuleAction::Backend(id)) => {
                if let Some(state) = snapshot.get(id) {
                    if let Some(decision) = backend_decision(state) {
                        trace!(target = %target_host, server_id = %id, "Rule decision: pinned backend");
                        return Ok(decision);
                    }
                    debug!(
                        server_id = %id,
                        "Rule-selected backend unavailable, falling back to selection"
                    );
                } else {
                    debug!(server_id = %id, "Rule references unknown backend, falling back");
                }
            }
            Some(RuleAction::BackendGroup(ids)) => {
                group = Some(ids.clone());
            }
            None => {}
        }

        // Sticky lookup only runs where there is an actual choice to pin
        let sticky_applies = self.sticky.should_apply(target_host);
        let key = StickyKey::new(client.ip(), target_host);
        if sticky_applies {
            if let Some(hit) = self.sticky.get(&key, &snapshot) {
                if let Some(decision) = snapshot.get(&hit.server_id).and_then(backend_decision) {
                    trace!(
                        target = %target_host,
                        server_id = %hit.server_id,
                        "Sticky hit"
                    );
                    return Ok(decision);
                }
            }
        }

        let chosen = select_backend(&snapshot, group.as_deref()).ok_or_else(|| {
            let target = if target_host.contains(':') {
                format!("[{target_host}]:{target_port}")
            } else {
                format!("{target_host}:{target_port}")
            };
            DispatchError::no_backend(target)
        })?;

        let decision = backend_decision(chosen).expect("selection only yields bound backends");
        if sticky_applies {
            self.sticky.set(key, chosen.profile.id.clone());
        }

        trace!(
            target = %target_host,
            server_id = %chosen.profile.id,
            "Selected backend"
        );
        Ok(decision)
    }
}

impl crate::config::SettingsSubscriber for Dispatcher {
    fn on_settings_update(
        &self,
        module: &str,
        value: &serde_json::Value,
    ) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;
        match module {
            "gateway" => {
                let settings: StickySettings = serde_json::from_value(value.clone())
                    .map_err(|e| ConfigError::parse(format!("gateway module: {e}")))?;
                self.update_gateway(&settings);
                Ok(())
            }
            "routing" => {
                let settings: RoutingSettings = serde_json::from_value(value.clone())
                    .map_err(|e| ConfigError::parse(format!("routing module: {e}")))?;
                self.update_routing(&settings)
                    .map_err(|e| ConfigError::validation(e.to_string()))
            }
            other => Err(ConfigError::UnknownModule(other.to_string())),
        }
    }
}

/// Decision for one backend state, if it is usable right now
fn backend_decision(state: &ServerState) -> Option<Decision> {
    if !state.is_eligible() {
        return None;
    }
    let listen_addr = state.instance.as_ref()?.listen_addr()?;
    Some(Decision::Backend {
        listen_addr,
        server_id: state.profile.id.clone(),
    })
}

/// Least-connections selection with latency and id tie-breaks.
///
/// `group` restricts the candidate set when a backend-group rule matched.
fn select_backend<'a>(
    snapshot: &'a StateSnapshot,
    group: Option<&[String]>,
) -> Option<&'a ServerState> {
    let candidates = snapshot.values().filter(|state| {
        state.is_eligible()
            && group.map_or(true, |ids| ids.iter().any(|id| *id == state.profile.id))
    });

    candidates.min_by(|a, b| {
        let conn_a = a.metrics.active_connections.max(0);
        let conn_b = b.metrics.active_connections.max(0);
        conn_a
            .cmp(&conn_b)
            .then_with(|| latency_rank(a).cmp(&latency_rank(b)))
            .then_with(|| a.profile.id.cmp(&b.profile.id))
    })
}

/// Unknown latency (-1) sorts after every measured value
fn latency_rank(state: &ServerState) -> i64 {
    if state.metrics.latency_ms < 0 {
        i64::MAX
    } else {
        state.metrics.latency_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        HealthStatus, Metrics, ServerProfile, StateStore,
    };
    use crate::strategy::{StrategyKind, TunnelStrategy};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Strategy stub with a fixed listener address
    struct FixedListener(SocketAddr);

    #[async_trait]
    impl TunnelStrategy for FixedListener {
        async fn initialize(&self) -> Result<(), crate::error::StrategyError> {
            Ok(())
        }
        fn listen_addr(&self) -> Option<SocketAddr> {
            Some(self.0)
        }
        fn kind(&self) -> StrategyKind {
            StrategyKind::Multiplexed
        }
        async fn close(&self) {}
        fn update_profile(
            &self,
            _profile: Arc<ServerProfile>,
        ) -> Result<(), crate::error::StrategyError> {
            Ok(())
        }
        async fn check_health(&self) -> Result<(), crate::error::StrategyError> {
            Ok(())
        }
        fn metrics(&self) -> Metrics {
            Metrics::default()
        }
    }

    fn backend(id: &str, port: u16, connections: i64, latency: i64) -> ServerState {
        let profile = Arc::new(ServerProfile {
            id: id.to_string(),
            remarks: id.to_string(),
            kind: "multiplexed".to_string(),
            address: "example.com".to_string(),
            port: 443,
            scheme: "wss".to_string(),
            path: "/".to_string(),
            edge_ip: String::new(),
            local_port: 0,
            active: true,
            network: String::new(),
            crypt_key_id: None,
        });
        let mut state = ServerState::new(profile);
        state.health = HealthStatus::Up;
        state.instance = Some(Arc::new(FixedListener(
            format!("127.0.0.1:{port}").parse().unwrap(),
        )));
        state.metrics = Metrics {
            active_connections: connections,
            latency_ms: latency,
        };
        state
    }

    struct FixedState(Arc<StateSnapshot>);

    impl StateProvider for FixedState {
        fn server_states(&self) -> Arc<StateSnapshot> {
            Arc::clone(&self.0)
        }
    }

    fn provider(states: Vec<ServerState>) -> Arc<dyn StateProvider> {
        let map: HashMap<String, ServerState> = states
            .into_iter()
            .map(|s| (s.profile.id.clone(), s))
            .collect();
        Arc::new(FixedState(Arc::new(map)))
    }

    fn dispatcher_with(
        states: Vec<ServerState>,
        sticky: StickySettings,
        routing: RoutingSettings,
    ) -> Dispatcher {
        Dispatcher::new(provider(states), &sticky, &routing).unwrap()
    }

    fn client() -> SocketAddr {
        "10.0.0.5:51000".parse().unwrap()
    }

    #[test]
    fn test_least_connections_selection() {
        let dispatcher = dispatcher_with(
            vec![
                backend("srv-a", 10001, 7, 40),
                backend("srv-b", 10002, 2, 90),
            ],
            StickySettings::default(),
            RoutingSettings::default(),
        );

        let decision = dispatcher.dispatch(client(), "example.com", 443).unwrap();
        assert_eq!(
            decision,
            Decision::Backend {
                listen_addr: "127.0.0.1:10002".parse().unwrap(),
                server_id: "srv-b".to_string(),
            }
        );
    }

    #[test]
    fn test_latency_breaks_connection_ties() {
        let dispatcher = dispatcher_with(
            vec![
                backend("srv-a", 10001, 3, 90),
                backend("srv-b", 10002, 3, 15),
                backend("srv-c", 10003, 3, -1),
            ],
            StickySettings::default(),
            RoutingSettings::default(),
        );

        let decision = dispatcher.dispatch(client(), "example.com", 443).unwrap();
        assert!(matches!(
            decision,
            Decision::Backend { server_id, .. } if server_id == "srv-b"
        ));
    }

    #[test]
    fn test_id_breaks_full_ties() {
        let dispatcher = dispatcher_with(
            vec![
                backend("srv-b", 10002, 1, 20),
                backend("srv-a", 10001, 1, 20),
            ],
            StickySettings::default(),
            RoutingSettings::default(),
        );

        let decision = dispatcher.dispatch(client(), "example.com", 443).unwrap();
        assert!(matches!(
            decision,
            Decision::Backend { server_id, .. } if server_id == "srv-a"
        ));
    }

    #[test]
    fn test_no_backend_error() {
        let mut down = backend("srv-a", 10001, 0, 10);
        down.health = HealthStatus::Down;

        let dispatcher = dispatcher_with(
            vec![down],
            StickySettings::default(),
            RoutingSettings::default(),
        );

        let err = dispatcher.dispatch(client(), "example.com", 443).unwrap_err();
        assert!(matches!(err, DispatchError::NoBackend { .. }));
    }

    #[test]
    fn test_reject_rule() {
        let routing = RoutingSettings {
            rules: vec![RuleConfigBuilder::new("domain", "blocked.example", "reject").build()],
        };
        let dispatcher = dispatcher_with(
            vec![backend("srv-a", 10001, 0, 10)],
            StickySettings::default(),
            routing,
        );

        assert!(matches!(
            dispatcher.dispatch(client(), "blocked.example", 443),
            Err(DispatchError::Rejected)
        ));
        // Other targets still route
        assert!(dispatcher.dispatch(client(), "ok.example", 443).is_ok());
    }

    #[test]
    fn test_direct_rule() {
        let routing = RoutingSettings {
            rules: vec![RuleConfigBuilder::new("domain-glob", "*.internal", "direct").build()],
        };
        let dispatcher = dispatcher_with(
            vec![backend("srv-a", 10001, 0, 10)],
            StickySettings::default(),
            routing,
        );

        assert_eq!(
            dispatcher.dispatch(client(), "git.internal", 22).unwrap(),
            Decision::Direct
        );
    }

    #[test]
    fn test_named_backend_rule_with_fallback() {
        let routing = RoutingSettings {
            rules: vec![RuleConfigBuilder::new("default", "", "backend")
                .backend("srv-b")
                .build()],
        };

        // srv-b healthy: the rule pins it even though srv-a has fewer
        // connections
        let dispatcher = dispatcher_with(
            vec![
                backend("srv-a", 10001, 0, 10),
                backend("srv-b", 10002, 50, 200),
            ],
            StickySettings::default(),
            routing.clone(),
        );
        assert!(matches!(
            dispatcher.dispatch(client(), "example.com", 443).unwrap(),
            Decision::Backend { server_id, .. } if server_id == "srv-b"
        ));

        // srv-b down: selection falls back to the healthy candidate
        let mut down_b = backend("srv-b", 10002, 50, 200);
        down_b.health = HealthStatus::Down;
        let dispatcher = dispatcher_with(
            vec![backend("srv-a", 10001, 0, 10), down_b],
            StickySettings::default(),
            routing,
        );
        assert!(matches!(
            dispatcher.dispatch(client(), "example.com", 443).unwrap(),
            Decision::Backend { server_id, .. } if server_id == "srv-a"
        ));
    }

    #[test]
    fn test_backend_group_restricts_candidates() {
        let routing = RoutingSettings {
            rules: vec![RuleConfigBuilder::new("default", "", "backend-group")
                .backends(&["srv-b", "srv-c"])
                .build()],
        };
        let dispatcher = dispatcher_with(
            vec![
                backend("srv-a", 10001, 0, 1),
                backend("srv-b", 10002, 9, 50),
                backend("srv-c", 10003, 4, 50),
            ],
            StickySettings::default(),
            routing,
        );

        // srv-a would win on load but is outside the group
        assert!(matches!(
            dispatcher.dispatch(client(), "example.com", 443).unwrap(),
            Decision::Backend { server_id, .. } if server_id == "srv-c"
        ));
    }

    #[test]
    fn test_sticky_pins_across_dispatches() {
        let sticky = StickySettings {
            sticky_session_mode: crate::sticky::StickyMode::Global,
            sticky_session_ttl: 300,
            sticky_rules: Vec::new(),
        };
        let dispatcher = dispatcher_with(
            vec![
                backend("srv-a", 10001, 5, 10),
                backend("srv-b", 10002, 0, 10),
            ],
            sticky,
            RoutingSettings::default(),
        );

        // First dispatch picks the least-loaded backend and pins it
        let first = dispatcher.dispatch(client(), "api.example.com", 443).unwrap();
        let Decision::Backend { server_id: pinned, .. } = first else {
            panic!("expected a backend decision");
        };

        // Second dispatch returns the pin even though load may differ
        let second = dispatcher.dispatch(client(), "api.example.com", 443).unwrap();
        assert!(matches!(
            second,
            Decision::Backend { server_id, .. } if server_id == pinned
        ));
    }

    #[test]
    fn test_routing_update_is_atomic() {
        let dispatcher = dispatcher_with(
            vec![backend("srv-a", 10001, 0, 10)],
            StickySettings::default(),
            RoutingSettings::default(),
        );

        // A broken update leaves the previous rules in place
        let broken = RoutingSettings {
            rules: vec![RuleConfigBuilder::new("bogus", "", "direct").build()],
        };
        assert!(dispatcher.update_routing(&broken).is_err());
        assert!(dispatcher.dispatch(client(), "example.com", 443).is_ok());

        // A valid update takes effect for the next dispatch
        let reject_all = RoutingSettings {
            rules: vec![RuleConfigBuilder::new("default", "", "reject").build()],
        };
        dispatcher.update_routing(&reject_all).unwrap();
        assert!(matches!(
            dispatcher.dispatch(client(), "example.com", 443),
            Err(DispatchError::Rejected)
        ));
    }

    /// Small helper to keep rule construction readable
    struct RuleConfigBuilder {
        config: crate::rules::RuleConfig,
    }

    impl RuleConfigBuilder {
        fn new(kind: &str, value: &str, action: &str) -> Self {
            Self {
                config: crate::rules::RuleConfig {
                    kind: kind.to_string(),
                    value: value.to_string(),
                    action: action.to_string(),
                    backend: String::new(),
                    backends: Vec::new(),
                },
            }
        }

        fn backend(mut self, id: &str) -> Self {
            self.config.backend = id.to_string();
            self
        }

        fn backends(mut self, ids: &[&str]) -> Self {
            self.config.backends = ids.iter().map(ToString::to_string).collect();
            self
        }

        fn build(self) -> crate::rules::RuleConfig {
            self.config
        }
    }

    // StateStore also satisfies the provider contract end to end
    #[tokio::test]
    async fn test_dispatcher_over_state_store() {
        let store = Arc::new(StateStore::new());
        {
            let mut config = store.config_state_mut().await;
            let state = backend("srv-a", 10001, 0, 10);
            config.insert("srv-a".to_string(), state);
        }
        store.publish().await;

        let dispatcher = Dispatcher::new(
            store,
            &StickySettings::default(),
            &RoutingSettings::default(),
        )
        .unwrap();
        assert!(dispatcher.dispatch(client(), "example.com", 443).is_ok());
    }
}
