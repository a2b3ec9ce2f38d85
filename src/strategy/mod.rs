//! Tunnel strategies
//!
//! A strategy implements the client side of one backend type: it binds a
//! local SOCKS5 listener, carries accepted connections to the remote
//! endpoint in its own way, and answers health probes. The closed variant
//! set currently holds two families:
//!
//! - [`multiplexed`]: one long-lived encrypted tunnel, many logical streams
//! - [`per_request`]: one short-lived tunnel per client connection
//!
//! The controller owns strategy instances through the [`TunnelStrategy`]
//! trait and never looks inside them.

pub mod multiplexed;
pub mod per_request;
pub(crate) mod socks;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::error::{ConfigError, StrategyError};
use crate::state::{Metrics, ServerProfile};
use crate::transport::{TlsConfig, TransportConfig};

/// Strategy families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Persistent multiplexed tunnel
    Multiplexed,
    /// Short-lived tunnel per request
    PerRequest,
}

impl StrategyKind {
    /// Parse the profile `type` field.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized string for error reporting.
    pub fn parse(kind: &str) -> Result<Self, String> {
        match kind {
            "multiplexed" => Ok(Self::Multiplexed),
            "per-request" => Ok(Self::PerRequest),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Multiplexed => write!(f, "multiplexed"),
            Self::PerRequest => write!(f, "per-request"),
        }
    }
}

/// The strategy contract
///
/// Lifecycle: `initialize` binds the local listener (and pre-connects for
/// the multiplexed family); `close` tears the listener, live sessions, and
/// the tunnel down and joins workers. Instances are never restarted — the
/// controller builds a fresh one instead.
#[async_trait]
pub trait TunnelStrategy: Send + Sync {
    /// Bind the local listener and make the strategy ready for traffic.
    ///
    /// # Errors
    ///
    /// Returns `StrategyError::BindFailed` if the listener cannot bind;
    /// pre-connect failures of the multiplexed family are reported here as
    /// transport errors.
    async fn initialize(&self) -> Result<(), StrategyError>;

    /// The bound local listener address, if initialized
    fn listen_addr(&self) -> Option<SocketAddr>;

    /// Which family this instance belongs to
    fn kind(&self) -> StrategyKind;

    /// Tear down the listener, all live sessions, and the tunnel
    async fn close(&self);

    /// Hot-swap the profile without rebinding the listener.
    ///
    /// # Errors
    ///
    /// Returns `StrategyError::HotUpdateUnsupported` for families whose
    /// connections are too short-lived to care (the controller rebuilds
    /// the instance instead).
    fn update_profile(&self, profile: Arc<ServerProfile>) -> Result<(), StrategyError>;

    /// Probe the backend end-to-end.
    ///
    /// # Errors
    ///
    /// Any error means the probe failed and the backend should be marked
    /// down.
    async fn check_health(&self) -> Result<(), StrategyError>;

    /// Current connection metrics
    fn metrics(&self) -> Metrics;
}

impl std::fmt::Debug for dyn TunnelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStrategy")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Build a strategy instance from a profile.
///
/// # Errors
///
/// Returns `ConfigError::UnknownStrategy` for unsupported profile types
/// and validation errors for incomplete profiles.
pub fn build_strategy(
    config: &Arc<AppConfig>,
    profile: Arc<ServerProfile>,
) -> Result<Arc<dyn TunnelStrategy>, ConfigError> {
    profile.validate().map_err(ConfigError::validation)?;

    let kind = StrategyKind::parse(&profile.kind).map_err(|kind| ConfigError::UnknownStrategy {
        kind,
        id: profile.id.clone(),
    })?;

    let crypt_key = profile.crypt_key_id.unwrap_or(config.crypt_key);

    match kind {
        StrategyKind::Multiplexed => Ok(multiplexed::MultiplexedStrategy::new(
            profile,
            crypt_key,
            config.buffer_size,
        )),
        StrategyKind::PerRequest => Ok(per_request::PerRequestStrategy::new(
            profile, crypt_key,
        )),
    }
}

/// Translate a profile into an outbound transport configuration
pub(crate) fn transport_config(profile: &ServerProfile) -> TransportConfig {
    let mut config = TransportConfig::ws(&profile.address, profile.port, &profile.path);
    if profile.scheme == "wss" {
        config = config.with_tls(TlsConfig::new(&profile.address));
    }
    if !profile.edge_ip.is_empty() {
        config = config.with_edge_ip(&profile.edge_ip);
    }
    config
}
