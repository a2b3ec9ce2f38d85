//! Outbound transport layer
//!
//! Backends are reached over WebSocket (`ws://` or `wss://`). The transport
//! layer hides the message framing behind a plain byte-stream interface so
//! the packet codec above it can treat a tunnel like any other duplex
//! socket.
//!
//! ```text
//! TransportConfig
//!       |
//!       v
//!   connect()  -- TCP dial (edge-ip override aware)
//!       |        -- optional TLS (SNI = profile hostname)
//!       v        -- WebSocket upgrade (custom Host + User-Agent)
//!   WsByteStream (AsyncRead + AsyncWrite over binary messages)
//! ```
//!
//! Deadlines are applied by callers with `tokio::time::timeout` around the
//! individual reads and writes; the dial path enforces `connect_timeout` on
//! each phase (TCP, TLS, upgrade) itself.

mod websocket;

pub use websocket::WsByteStream;

use std::time::Duration;

use crate::error::TransportError;

/// User-Agent header sent on every WebSocket upgrade
pub const USER_AGENT: &str = "rust-gateway/0.4";

/// Configuration for establishing an outbound tunnel transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Remote hostname (drives DNS, the Host header, and TLS SNI)
    pub address: String,

    /// Remote port
    pub port: u16,

    /// TLS configuration (`None` for plain `ws://`)
    pub tls: Option<TlsConfig>,

    /// WebSocket upgrade configuration
    pub websocket: WebSocketConfig,

    /// Connect-time host override: when set, the TCP connection is made to
    /// this address while the Host header and TLS SNI keep using `address`
    pub edge_ip: Option<String>,

    /// Per-phase connection timeout
    pub connect_timeout: Duration,

    /// Enable TCP keepalive probes on the underlying socket
    pub tcp_keepalive: bool,

    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
}

impl TransportConfig {
    /// Create a plain `ws://` transport configuration
    ///
    /// # Example
    ///
    /// ```
    /// use rust_gateway::transport::{TransportConfig, WebSocketConfig};
    ///
    /// let config = TransportConfig::ws("example.com", 80, "/tunnel");
    /// assert!(config.tls.is_none());
    /// assert_eq!(config.websocket.path, "/tunnel");
    /// ```
    #[must_use]
    pub fn ws(address: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            tls: None,
            websocket: WebSocketConfig::new(path),
            edge_ip: None,
            connect_timeout: Duration::from_secs(15),
            tcp_keepalive: true,
            tcp_nodelay: true,
        }
    }

    /// Add TLS (turns the transport into `wss://`)
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the connect-time host override
    #[must_use]
    pub fn with_edge_ip(mut self, edge_ip: impl Into<String>) -> Self {
        let edge_ip = edge_ip.into();
        if !edge_ip.is_empty() {
            self.edge_ip = Some(edge_ip);
        }
        self
    }

    /// Set the per-phase connection timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Address actually dialed over TCP (`edge_ip` wins when present)
    #[must_use]
    pub fn dial_address(&self) -> String {
        match &self.edge_ip {
            Some(edge) => format!("{edge}:{}", self.port),
            None => format!("{}:{}", self.address, self.port),
        }
    }

    /// The logical `host:port` of the remote endpoint
    #[must_use]
    pub fn address_string(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// TLS configuration for `wss://` transports
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Server name for SNI and certificate verification
    pub server_name: String,

    /// Skip certificate verification (testing only)
    pub skip_verify: bool,
}

impl TlsConfig {
    /// Create a TLS configuration with certificate verification enabled
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            skip_verify: false,
        }
    }

    /// Disable certificate verification (INSECURE, testing only)
    #[must_use]
    pub fn insecure_skip_verify(mut self) -> Self {
        self.skip_verify = true;
        self
    }
}

/// WebSocket upgrade configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upgrade path (e.g. `/tunnel`)
    pub path: String,

    /// Extra headers for the upgrade request
    pub headers: Vec<(String, String)>,
}

impl WebSocketConfig {
    /// Create a WebSocket configuration for `path`
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// Add a custom upgrade header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Connect to the remote endpoint described by `config`.
///
/// # Errors
///
/// Returns `TransportError` if DNS resolution, the TCP dial, the TLS
/// handshake, or the WebSocket upgrade fails or times out.
pub async fn connect(config: &TransportConfig) -> Result<WsByteStream, TransportError> {
    websocket::connect(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_ws() {
        let config = TransportConfig::ws("example.com", 8080, "/ws");
        assert_eq!(config.address, "example.com");
        assert_eq!(config.port, 8080);
        assert!(config.tls.is_none());
        assert!(config.edge_ip.is_none());
        assert_eq!(config.dial_address(), "example.com:8080");
        assert_eq!(config.address_string(), "example.com:8080");
    }

    #[test]
    fn test_edge_ip_overrides_dial_only() {
        let config = TransportConfig::ws("cdn.example.com", 443, "/t")
            .with_tls(TlsConfig::new("cdn.example.com"))
            .with_edge_ip("203.0.113.9");

        assert_eq!(config.dial_address(), "203.0.113.9:443");
        // The logical endpoint (Host header, SNI) is unchanged
        assert_eq!(config.address_string(), "cdn.example.com:443");
        assert_eq!(config.tls.as_ref().unwrap().server_name, "cdn.example.com");
    }

    #[test]
    fn test_empty_edge_ip_ignored() {
        let config = TransportConfig::ws("example.com", 80, "/t").with_edge_ip("");
        assert!(config.edge_ip.is_none());
    }

    #[test]
    fn test_tls_config() {
        let tls = TlsConfig::new("example.com").insecure_skip_verify();
        assert_eq!(tls.server_name, "example.com");
        assert!(tls.skip_verify);
    }

    #[test]
    fn test_websocket_config_headers() {
        let ws = WebSocketConfig::new("/path").with_header("X-Auth", "token");
        assert_eq!(ws.path, "/path");
        assert_eq!(ws.headers.len(), 1);
    }
}
