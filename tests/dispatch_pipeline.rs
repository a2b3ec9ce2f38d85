//! Dispatch pipeline integration: state store, sticky cache, rule engine
//!
//! Exercises the published-snapshot path the gateway uses: states flow
//! A-zone -> publish -> B-zone -> dispatch, with sticky pins revalidated
//! against each fresh snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use rust_gateway::dispatch::{Decision, Dispatcher};
use rust_gateway::error::{DispatchError, StrategyError};
use rust_gateway::rules::{RoutingSettings, RuleConfig};
use rust_gateway::state::{
    HealthStatus, Metrics, ServerProfile, ServerState, StateStore,
};
use rust_gateway::sticky::{StickyMode, StickySettings};
use rust_gateway::strategy::{StrategyKind, TunnelStrategy};

/// Strategy stub pinned to a fixed listener address
struct StubStrategy {
    addr: SocketAddr,
}

#[async_trait]
impl TunnelStrategy for StubStrategy {
    async fn initialize(&self) -> Result<(), StrategyError> {
        Ok(())
    }
    fn listen_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
    fn kind(&self) -> StrategyKind {
        StrategyKind::Multiplexed
    }
    async fn close(&self) {}
    fn update_profile(&self, _profile: Arc<ServerProfile>) -> Result<(), StrategyError> {
        Ok(())
    }
    async fn check_health(&self) -> Result<(), StrategyError> {
        Ok(())
    }
    fn metrics(&self) -> Metrics {
        Metrics::default()
    }
}

fn profile(id: &str) -> Arc<ServerProfile> {
    Arc::new(ServerProfile {
        id: id.to_string(),
        remarks: format!("backend-{id}"),
        kind: "multiplexed".to_string(),
        address: "remote.example.com".to_string(),
        port: 443,
        scheme: "wss".to_string(),
        path: "/tunnel".to_string(),
        edge_ip: String::new(),
        local_port: 0,
        active: true,
        network: String::new(),
        crypt_key_id: None,
    })
}

fn backend(id: &str, port: u16, connections: i64) -> ServerState {
    let mut state = ServerState::new(profile(id));
    state.health = HealthStatus::Up;
    state.instance = Some(Arc::new(StubStrategy {
        addr: format!("127.0.0.1:{port}").parse().unwrap(),
    }));
    state.metrics = Metrics {
        active_connections: connections,
        latency_ms: 25,
    };
    state
}

fn client() -> SocketAddr {
    "10.0.0.5:40000".parse().unwrap()
}

fn sticky_global(ttl: u64) -> StickySettings {
    StickySettings {
        sticky_session_mode: StickyMode::Global,
        sticky_session_ttl: ttl,
        sticky_rules: Vec::new(),
    }
}

async fn store_with(states: Vec<ServerState>) -> Arc<StateStore> {
    let store = Arc::new(StateStore::new());
    {
        let mut zone = store.config_state_mut().await;
        for state in states {
            zone.insert(state.profile.id.clone(), state);
        }
    }
    store.publish().await;
    store
}

#[tokio::test]
async fn sticky_hit_survives_load_changes() {
    // srv-b starts least loaded and gets pinned
    let store = store_with(vec![backend("srv-a", 10001, 5), backend("srv-b", 10002, 0)]).await;
    let dispatcher =
        Dispatcher::new(store.clone(), &sticky_global(300), &RoutingSettings::default()).unwrap();

    let first = dispatcher
        .dispatch(client(), "api.example.com", 443)
        .unwrap();
    let Decision::Backend { server_id: pinned, .. } = first else {
        panic!("expected backend decision");
    };
    assert_eq!(pinned, "srv-b");

    // Load flips in a new publication; the pin must still win
    {
        let mut zone = store.config_state_mut().await;
        zone.get_mut("srv-a").unwrap().metrics.active_connections = 0;
        zone.get_mut("srv-b").unwrap().metrics.active_connections = 50;
    }
    store.publish().await;

    let second = dispatcher
        .dispatch(client(), "api.example.com", 443)
        .unwrap();
    assert!(matches!(
        second,
        Decision::Backend { server_id, .. } if server_id == "srv-b"
    ));
}

#[tokio::test]
async fn health_flip_breaks_the_pin() {
    let store = store_with(vec![backend("srv-a", 10001, 5), backend("srv-b", 10002, 0)]).await;
    let dispatcher =
        Dispatcher::new(store.clone(), &sticky_global(300), &RoutingSettings::default()).unwrap();

    let first = dispatcher
        .dispatch(client(), "api.example.com", 443)
        .unwrap();
    let Decision::Backend { server_id: pinned, .. } = first else {
        panic!("expected backend decision");
    };
    assert_eq!(pinned, "srv-b");

    // The pinned backend goes down and the change is published
    {
        let mut zone = store.config_state_mut().await;
        zone.get_mut("srv-b").unwrap().health = HealthStatus::Down;
    }
    store.publish().await;

    // Next dispatch re-validates the pin, drops it, and picks the
    // remaining healthy backend
    let second = dispatcher
        .dispatch(client(), "api.example.com", 443)
        .unwrap();
    assert!(matches!(
        second,
        Decision::Backend { server_id, .. } if server_id == "srv-a"
    ));
    // The stale entry is gone; srv-a is the new pin
    assert_eq!(dispatcher.sticky().len(), 1);
}

#[tokio::test]
async fn all_backends_down_is_policy_error() {
    let mut a = backend("srv-a", 10001, 0);
    a.health = HealthStatus::Down;
    let store = store_with(vec![a]).await;
    let dispatcher =
        Dispatcher::new(store, &StickySettings::default(), &RoutingSettings::default()).unwrap();

    assert!(matches!(
        dispatcher.dispatch(client(), "api.example.com", 443),
        Err(DispatchError::NoBackend { .. })
    ));
}

#[tokio::test]
async fn unpublished_changes_stay_invisible() {
    let store = store_with(vec![backend("srv-a", 10001, 0)]).await;
    let dispatcher =
        Dispatcher::new(store.clone(), &StickySettings::default(), &RoutingSettings::default())
            .unwrap();

    // A-zone mutation without publish: dispatch keeps seeing the old state
    {
        let mut zone = store.config_state_mut().await;
        zone.get_mut("srv-a").unwrap().health = HealthStatus::Down;
    }
    assert!(dispatcher.dispatch(client(), "x.example.com", 443).is_ok());

    store.publish().await;
    assert!(dispatcher.dispatch(client(), "x.example.com", 443).is_err());
}

#[tokio::test]
async fn routing_module_update_applies_atomically() {
    let store = store_with(vec![backend("srv-a", 10001, 0)]).await;
    let dispatcher = Arc::new(
        Dispatcher::new(store, &StickySettings::default(), &RoutingSettings::default()).unwrap(),
    );

    assert!(dispatcher.dispatch(client(), "blocked.example", 443).is_ok());

    let routing = RoutingSettings {
        rules: vec![RuleConfig {
            kind: "domain".to_string(),
            value: "blocked.example".to_string(),
            action: "reject".to_string(),
            backend: String::new(),
            backends: Vec::new(),
        }],
    };
    dispatcher.update_routing(&routing).unwrap();

    assert!(matches!(
        dispatcher.dispatch(client(), "blocked.example", 443),
        Err(DispatchError::Rejected)
    ));
    assert!(dispatcher.dispatch(client(), "open.example", 443).is_ok());
}
