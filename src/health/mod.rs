//! Health probing of active strategy instances
//!
//! Probes run concurrently, one per instance, each under a hard cap. A
//! probe asks the strategy itself (`check_health`): the multiplexed family
//! proves its persistent tunnel, the per-request family performs a minimal
//! dial. Latency is measured around the probe and fed into the metrics the
//! dispatcher uses for tie-breaking.
//!
//! The checker only computes results; the controller merges them into the
//! A-zone and publishes if anything changed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::time::timeout;
use tracing::debug;

use crate::state::{HealthStatus, Metrics};
use crate::strategy::TunnelStrategy;

/// Hard cap on a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health checker
#[derive(Debug, Default)]
pub struct Checker;

impl Checker {
    /// Create a checker
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Probe every given instance concurrently.
    ///
    /// Returns the new health status and refreshed metrics per server id.
    pub async fn check(
        &self,
        instances: HashMap<String, Arc<dyn TunnelStrategy>>,
    ) -> (HashMap<String, HealthStatus>, HashMap<String, Metrics>) {
        let probes = instances.into_iter().map(|(server_id, instance)| async move {
            let (health, metrics) = probe_one(&instance).await;
            (server_id, health, metrics)
        });

        let mut health_map = HashMap::new();
        let mut metrics_map = HashMap::new();
        for (server_id, health, metrics) in join_all(probes).await {
            debug!(server_id = %server_id, health = %health, latency_ms = metrics.latency_ms, "Probe finished");
            health_map.insert(server_id.clone(), health);
            metrics_map.insert(server_id, metrics);
        }
        (health_map, metrics_map)
    }

    /// Probe a single instance (failure-threshold path)
    pub async fn check_one(&self, instance: &Arc<dyn TunnelStrategy>) -> (HealthStatus, Metrics) {
        probe_one(instance).await
    }
}

async fn probe_one(instance: &Arc<dyn TunnelStrategy>) -> (HealthStatus, Metrics) {
    let mut metrics = instance.metrics();
    metrics.latency_ms = -1;

    // An instance without a bound listener is down regardless of the remote
    if instance.listen_addr().is_none() {
        return (HealthStatus::Down, metrics);
    }

    let start = Instant::now();
    let result = timeout(PROBE_TIMEOUT, instance.check_health()).await;
    match result {
        Ok(Ok(())) => {
            metrics.latency_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            (HealthStatus::Up, metrics)
        }
        Ok(Err(_)) | Err(_) => (HealthStatus::Down, metrics),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::state::ServerProfile;
    use crate::strategy::StrategyKind;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        bound: bool,
        healthy: bool,
        delay: Duration,
        probes: AtomicUsize,
    }

    impl Probe {
        fn new(bound: bool, healthy: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                bound,
                healthy,
                delay,
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TunnelStrategy for Probe {
        async fn initialize(&self) -> Result<(), StrategyError> {
            Ok(())
        }
        fn listen_addr(&self) -> Option<SocketAddr> {
            self.bound.then(|| "127.0.0.1:10001".parse().unwrap())
        }
        fn kind(&self) -> StrategyKind {
            StrategyKind::Multiplexed
        }
        async fn close(&self) {}
        fn update_profile(&self, _p: std::sync::Arc<ServerProfile>) -> Result<(), StrategyError> {
            Ok(())
        }
        async fn check_health(&self) -> Result<(), StrategyError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.healthy {
                Ok(())
            } else {
                Err(StrategyError::NotReady("probe failed".into()))
            }
        }
        fn metrics(&self) -> Metrics {
            Metrics {
                active_connections: 3,
                latency_ms: -1,
            }
        }
    }

    #[tokio::test]
    async fn test_check_mixed_results() {
        let up = Probe::new(true, true, Duration::from_millis(10));
        let down = Probe::new(true, false, Duration::from_millis(10));
        let unbound = Probe::new(false, true, Duration::ZERO);

        let mut instances: HashMap<String, Arc<dyn TunnelStrategy>> = HashMap::new();
        instances.insert("up".to_string(), up.clone());
        instances.insert("down".to_string(), down);
        instances.insert("unbound".to_string(), unbound.clone());

        let (health, metrics) = Checker::new().check(instances).await;

        assert_eq!(health["up"], HealthStatus::Up);
        assert_eq!(health["down"], HealthStatus::Down);
        assert_eq!(health["unbound"], HealthStatus::Down);

        // Up instance has a measured latency, failures keep -1
        assert!(metrics["up"].latency_ms >= 0);
        assert_eq!(metrics["down"].latency_ms, -1);
        // The unbound instance was never probed
        assert_eq!(unbound.probes.load(Ordering::SeqCst), 0);
        // Active-connection counts pass through
        assert_eq!(metrics["up"].active_connections, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_down() {
        let slow: Arc<dyn TunnelStrategy> =
            Probe::new(true, true, PROBE_TIMEOUT + Duration::from_secs(1));
        let (health, metrics) = Checker::new().check_one(&slow).await;
        assert_eq!(health, HealthStatus::Down);
        assert_eq!(metrics.latency_ms, -1);
    }

    #[tokio::test]
    async fn test_probes_run_concurrently() {
        // Four probes of 100ms each must finish well under 400ms
        let mut instances: HashMap<String, Arc<dyn TunnelStrategy>> = HashMap::new();
        for i in 0..4 {
            instances.insert(
                format!("srv-{i}"),
                Probe::new(true, true, Duration::from_millis(100)),
            );
        }

        let start = Instant::now();
        let (health, _) = Checker::new().check(instances).await;
        assert!(health.values().all(|h| *h == HealthStatus::Up));
        assert!(start.elapsed() < Duration::from_millis(350));
    }
}
