//! Error types for rust-gateway
//!
//! Errors are grouped by subsystem. Each enum carries an `is_recoverable()`
//! hint so callers can decide between retrying (dial again, pick another
//! backend) and tearing a connection down.

use std::io;

use thiserror::Error;

/// Top-level error type for rust-gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Framed-packet codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Cipher construction and AEAD failures
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport dial and I/O errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Dispatch / routing policy errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Tunnel strategy errors
    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// Protocol sniffing errors
    #[error("Sniff error: {0}")]
    Sniff(#[from] SniffError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Codec(e) => e.is_recoverable(),
            Self::Crypto(_) => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Dispatch(e) => e.is_recoverable(),
            Self::Strategy(e) => e.is_recoverable(),
            Self::Sniff(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// INI/JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Unknown settings module key
    #[error("Unknown settings module: {0}")]
    UnknownModule(String),

    /// Unknown strategy type in a server profile
    #[error("Unknown strategy type '{kind}' for server '{id}'")]
    UnknownStrategy { kind: String, id: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Framed-packet codec errors
///
/// These correspond to the protocol contract: a decoder never reads past the
/// declared frame length, rejects oversized frames before allocating, and
/// treats unknown flags as malformed input.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Declared frame length exceeds the configured maximum
    #[error("Frame length {len} exceeds maximum {max}")]
    OversizedFrame { len: usize, max: usize },

    /// Frame body shorter than the minimum header (or declared length)
    #[error("Truncated frame: {0}")]
    TruncatedFrame(String),

    /// Flag byte outside the known set
    #[error("Unknown packet flag: {0:#04x}")]
    UnknownFlag(u8),

    /// Malformed stream-open metadata
    #[error("Malformed stream metadata: {0}")]
    BadMetadata(String),

    /// AEAD open failed (tag mismatch or tampered ciphertext)
    #[error("Packet authentication failed: {0}")]
    Auth(#[from] CryptoError),

    /// Underlying transport I/O error
    #[error("Codec I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl CodecError {
    /// Codec errors poison the transport they occurred on; only plain I/O
    /// interruptions are worth retrying.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OversizedFrame { .. }
            | Self::TruncatedFrame(_)
            | Self::UnknownFlag(_)
            | Self::BadMetadata(_)
            | Self::Auth(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a truncated-frame error
    pub fn truncated(msg: impl Into<String>) -> Self {
        Self::TruncatedFrame(msg.into())
    }

    /// Create a bad-metadata error
    pub fn bad_metadata(msg: impl Into<String>) -> Self {
        Self::BadMetadata(msg.into())
    }
}

/// Cipher and AEAD errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material has the wrong length for the algorithm
    #[error("Invalid key length for {algorithm}")]
    InvalidKeyLength { algorithm: &'static str },

    /// AEAD seal failed (should not happen with a valid key/nonce)
    #[error("Encryption failed")]
    SealFailed,

    /// AEAD open failed: tag mismatch, wrong key, or tampered ciphertext
    #[error("Decryption failed: authentication tag mismatch")]
    Authentication,

    /// Ciphertext shorter than nonce + tag
    #[error("Ciphertext too short ({0} bytes)")]
    CiphertextTooShort(usize),
}

/// Transport-layer errors (dial, TLS, WebSocket)
#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS resolution failed
    #[error("DNS resolution failed for {address}: {reason}")]
    DnsFailed { address: String, reason: String },

    /// TCP connection failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// Operation timed out
    #[error("Operation timed out connecting to {address} after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    /// TLS handshake failed
    #[error("TLS handshake with {server_name} failed: {reason}")]
    TlsHandshake { server_name: String, reason: String },

    /// Server name is not a valid DNS name for TLS
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// WebSocket upgrade handshake failed
    #[error("WebSocket handshake failed: {0}")]
    WebSocketHandshake(String),

    /// WebSocket request construction failed
    #[error("Invalid WebSocket request: {0}")]
    InvalidRequest(String),

    /// Failed to set a socket option
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error on an established transport
    #[error("Transport I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is recoverable (a redial may succeed)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DnsFailed { .. }
            | Self::ConnectionFailed { .. }
            | Self::Timeout { .. }
            | Self::WebSocketHandshake(_) => true,
            Self::TlsHandshake { .. }
            | Self::InvalidServerName(_)
            | Self::InvalidRequest(_)
            | Self::SocketOption { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a DNS failure error
    pub fn dns_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            address: address.into(),
            timeout_ms,
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(server_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TlsHandshake {
            server_name: server_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a WebSocket handshake error
    pub fn websocket_handshake(reason: impl Into<String>) -> Self {
        Self::WebSocketHandshake(reason.into())
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Dispatch and routing policy errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A rule matched with the reject action
    #[error("Connection rejected by routing rule")]
    Rejected,

    /// No backend is eligible (none active, healthy, and bound)
    #[error("No eligible backend for target {target}")]
    NoBackend { target: String },

    /// Routing rule compilation failed
    #[error("Rule compilation failed: {0}")]
    RuleCompile(String),
}

impl DispatchError {
    /// Policy outcomes are final for the connection that triggered them,
    /// but the next dispatch may succeed once health recovers.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoBackend { .. })
    }

    /// Create a no-backend error
    pub fn no_backend(target: impl Into<String>) -> Self {
        Self::NoBackend {
            target: target.into(),
        }
    }
}

/// Tunnel strategy errors
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Local listener bind failed
    #[error("Failed to bind strategy listener on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// The remote endpoint did not confirm the stream in time
    #[error("Stream open timed out after {timeout_secs}s")]
    StreamOpenTimeout { timeout_secs: u64 },

    /// Waiting for a reconnection that did not complete
    #[error("Tunnel not ready: {0}")]
    NotReady(String),

    /// No free stream id (all 65530 ids are live)
    #[error("Stream id space exhausted")]
    StreamIdsExhausted,

    /// The remote rejected or aborted the stream
    #[error("Remote endpoint refused stream: {0}")]
    RemoteRefused(String),

    /// The strategy family rebuilds instead of hot-swapping profiles
    #[error("Strategy does not support hot profile updates")]
    HotUpdateUnsupported,

    /// Tunnel-level transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Tunnel-level codec failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// I/O error on the plaintext side
    #[error("Strategy I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StrategyError {
    /// Check if this error is recoverable (a new stream may succeed after
    /// the tunnel redials)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindFailed { .. } => false,
            Self::StreamOpenTimeout { .. }
            | Self::NotReady(_)
            | Self::StreamIdsExhausted
            | Self::RemoteRefused(_) => true,
            Self::HotUpdateUnsupported => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Codec(e) => e.is_recoverable(),
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Protocol sniffing errors
#[derive(Debug, Error)]
pub enum SniffError {
    /// First byte matches no supported protocol
    #[error("Unknown protocol, initial byte {0:#04x}")]
    UnknownProtocol(u8),

    /// Prefix looked like a known protocol but failed to parse
    #[error("Malformed {protocol} prefix: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },

    /// The peek budget elapsed before classification
    #[error("Sniff deadline exceeded")]
    Deadline,

    /// The client closed before sending a classifiable prefix
    #[error("Connection closed during sniffing")]
    Closed,

    /// I/O error while peeking
    #[error("Sniff I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SniffError {
    /// Create a malformed-prefix error
    pub fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `GatewayError`
pub type Result<T> = std::result::Result<T, GatewayError>;
