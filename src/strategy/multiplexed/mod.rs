//! Multiplexed persistent tunnel strategy
//!
//! One long-lived encrypted WebSocket transport carries many logical
//! streams, identified by a 16-bit stream id. The agent owns the tunnel
//! and redials it on demand; sessions are cheap and ride on top.
//!
//! ```text
//! local SOCKS5 clients          remote endpoint
//!        |                            |
//!   accept loop                       |
//!        v                            v
//!     Session --(stream id)--> [ single tunnel ] --> upstream targets
//!     Session --(stream id)-->        |
//!     UDP assoc --(0xFFFF)--->        |
//! ```

mod agent;
mod session;
mod udp;

pub(crate) use agent::Agent;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{StrategyKind, TunnelStrategy};
use crate::error::StrategyError;
use crate::state::{Metrics, ServerProfile};

/// Persistent multiplexed tunnel strategy handle
pub struct MultiplexedStrategy {
    agent: Arc<Agent>,
}

impl MultiplexedStrategy {
    /// Create an uninitialized strategy for `profile`
    pub fn new(
        profile: Arc<ServerProfile>,
        crypt_key: u32,
        buffer_size: usize,
    ) -> Arc<dyn TunnelStrategy> {
        Arc::new(Self {
            agent: Agent::new(profile, crypt_key, buffer_size),
        })
    }
}

#[async_trait]
impl TunnelStrategy for MultiplexedStrategy {
    async fn initialize(&self) -> Result<(), StrategyError> {
        self.agent.start().await
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        self.agent.listen_addr()
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Multiplexed
    }

    async fn close(&self) {
        self.agent.close().await;
    }

    fn update_profile(&self, profile: Arc<ServerProfile>) -> Result<(), StrategyError> {
        self.agent.update_profile(profile);
        Ok(())
    }

    async fn check_health(&self) -> Result<(), StrategyError> {
        // A live (or freshly dialed) tunnel is the health signal
        self.agent.connection().await.map(|_| ())
    }

    fn metrics(&self) -> Metrics {
        Metrics {
            active_connections: self.agent.active_connections(),
            latency_ms: -1,
        }
    }
}
