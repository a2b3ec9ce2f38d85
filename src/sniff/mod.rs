//! Protocol sniffing for the unified gateway port
//!
//! The gateway accepts SOCKS5, HTTP/1.x, and TLS on one listener and
//! classifies each connection by its first bytes:
//!
//! - `0x05` — SOCKS5: the method negotiation is answered inline, then the
//!   request header is parsed without being consumed
//! - `0x16` — TLS: the ClientHello is walked for the SNI extension
//! - ASCII uppercase — HTTP: the request line and Host header are parsed
//!
//! Sniffing is non-destructive where the downstream needs the bytes: TLS
//! and HTTP prefixes, and the SOCKS5 request header, remain in the caller's
//! buffer so they can be replayed to whatever backend the dispatcher picks.
//! Only the SOCKS5 greeting is consumed (it is answered here and must not
//! be forwarded).
//!
//! The whole classification runs under a 2-second budget.

pub mod http;
pub mod socks5;
pub mod tls;

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::SniffError;

/// Total peek budget for one connection
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on buffered prefix bytes while sniffing (a full 16 KiB TLS
/// record plus its header must fit)
const MAX_SNIFF_BYTES: usize = 32 * 1024;

/// Classified wire protocol of an inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SOCKS5 (greeting already answered)
    Socks5,
    /// HTTP/1.x (plain or CONNECT)
    Http,
    /// TLS (routed by SNI, forwarded opaquely)
    Tls,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socks5 => write!(f, "socks5"),
            Self::Http => write!(f, "http"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// Outcome of sniffing one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    /// Detected protocol
    pub protocol: Protocol,
    /// Target host (domain or IP literal, no port)
    pub host: String,
    /// Target port
    pub port: u16,
    /// For SOCKS5: the request command (1=CONNECT, 3=UDP ASSOCIATE)
    pub socks_command: u8,
    /// For HTTP: whether the request is CONNECT
    pub http_is_connect: bool,
}

impl SniffResult {
    /// `host:port` form used for dispatching and backend CONNECTs
    #[must_use]
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Read from `stream` into `buf` until it holds at least `n` bytes.
///
/// # Errors
///
/// Returns `SniffError::Closed` on EOF and `SniffError::IoError` on read
/// failures. The caller's overall deadline bounds the waiting.
pub(crate) async fn fill(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    n: usize,
) -> Result<(), SniffError> {
    if n > MAX_SNIFF_BYTES {
        return Err(SniffError::malformed(
            "prefix",
            format!("sniff window exceeds {MAX_SNIFF_BYTES} bytes"),
        ));
    }
    while buf.len() < n {
        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Err(SniffError::Closed);
        }
    }
    Ok(())
}

/// Classify one accepted connection and extract its routing target.
///
/// On return, `buf` holds exactly the prefix bytes the selected backend
/// path must see (TLS record, HTTP request, or SOCKS5 request header).
///
/// # Errors
///
/// Returns `SniffError::Deadline` when the 2-second budget elapses, and
/// protocol-specific errors for unclassifiable or malformed prefixes.
pub async fn sniff_connection(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<SniffResult, SniffError> {
    match timeout(SNIFF_TIMEOUT, sniff_inner(stream, buf)).await {
        Ok(result) => result,
        Err(_) => Err(SniffError::Deadline),
    }
}

async fn sniff_inner(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<SniffResult, SniffError> {
    fill(stream, buf, 1).await?;
    let first = buf[0];

    match first {
        0x05 => socks5::sniff_socks5(stream, buf).await,
        0x16 => tls::sniff_tls(stream, buf).await,
        b'A'..=b'Z' => http::sniff_http(stream, buf).await,
        other => Err(SniffError::UnknownProtocol(other)),
    }
}
