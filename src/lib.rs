//! rust-gateway: protocol-sniffing local proxy gateway
//!
//! A client-side admission and routing layer: one listening port accepts
//! SOCKS5, HTTP/1.x, and TLS traffic, classifies each connection, and
//! forwards it through a configurable remote backend over an encrypted,
//! multiplexed WebSocket tunnel.
//!
//! # Architecture
//!
//! ```text
//! Client -> Gateway (sniff) -> Dispatcher (rules, sticky, health) ->
//!     DIRECT  : splice to origin
//!     REJECT  : close
//!     Backend : SOCKS5 to strategy listener -> encrypted tunnel -> remote
//! ```
//!
//! Control plane: the controller mutates the A-zone under its write lock
//! and publishes immutable snapshots to the B-zone; dispatch reads only
//! published snapshots. The health checker probes active instances and
//! publishes on change.
//!
//! # Modules
//!
//! - [`codec`]: length-prefixed framed packets with optional AEAD
//! - [`crypto`]: AES-256-GCM / ChaCha20-Poly1305 ciphers
//! - [`transport`]: WebSocket dial + byte-stream adapter
//! - [`sniff`]: SOCKS5/HTTP/TLS classification
//! - [`sticky`]: TTL-based session affinity
//! - [`rules`] / [`dispatch`]: routing rules and backend selection
//! - [`state`]: profiles, runtime state, the A/B-zone double buffer
//! - [`strategy`]: tunnel strategies (multiplexed, per-request)
//! - [`health`]: concurrent backend probing
//! - [`app`]: the controller tying it all together
//! - [`gateway`]: the unified-port acceptor
//! - [`config`]: INI app config, server catalogue, settings modules

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod health;
pub mod rules;
pub mod sniff;
pub mod state;
pub mod sticky;
pub mod strategy;
pub mod transport;

// Re-export commonly used types at the crate root
pub use app::{AppController, FAILURE_THRESHOLD};
pub use codec::{Packet, PacketFlag, MAX_FRAME_LEN, UDP_STREAM_ID};
pub use config::{AppConfig, Settings, SettingsManager};
pub use crypto::{Algorithm, Cipher};
pub use dispatch::{Decision, Dispatcher};
pub use error::{
    CodecError, ConfigError, CryptoError, DispatchError, GatewayError, Result, SniffError,
    StrategyError, TransportError,
};
pub use gateway::Gateway;
pub use health::Checker;
pub use rules::{GeoIpResolver, NoGeoIp, RoutingSettings, RuleAction};
pub use sniff::{Protocol, SniffResult};
pub use state::{
    FailureReporter, HealthStatus, Metrics, ServerProfile, ServerState, StateProvider,
    StateSnapshot, StateStore,
};
pub use sticky::{StickyManager, StickyMode, StickySettings};
pub use strategy::{StrategyKind, TunnelStrategy};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
