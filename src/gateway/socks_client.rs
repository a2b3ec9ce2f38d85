//! SOCKS5 client toward backend strategy listeners
//!
//! The gateway converts HTTP and TLS traffic into SOCKS5 CONNECTs against
//! the selected strategy's loopback listener. Only the no-auth method is
//! spoken; the bound address in the reply is read and discarded.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::TransportError;

/// Dial timeout toward a loopback backend listener
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a SOCKS5 CONNECT tunnel to `host:port` through the backend
/// listener at `backend`.
///
/// # Errors
///
/// Returns `TransportError` for dial failures and protocol violations
/// (auth required, non-zero reply code, malformed reply).
pub async fn connect_via_socks(
    backend: SocketAddr,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    let mut conn = timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(backend))
        .await
        .map_err(|_| {
            TransportError::timeout(backend.to_string(), BACKEND_DIAL_TIMEOUT.as_millis() as u64)
        })?
        .map_err(|e| TransportError::connection_failed(backend.to_string(), e.to_string()))?;

    // Method negotiation: no-auth only
    conn.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method_reply = [0u8; 2];
    conn.read_exact(&mut method_reply).await?;
    if method_reply != [0x05, 0x00] {
        return Err(TransportError::connection_failed(
            backend.to_string(),
            format!("backend requires authentication: {method_reply:?}"),
        ));
    }

    // CONNECT request
    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(TransportError::connection_failed(
                    backend.to_string(),
                    format!("hostname too long: {host}"),
                ));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        return Err(TransportError::connection_failed(
            backend.to_string(),
            format!("invalid reply version {}", head[0]),
        ));
    }
    if head[1] != 0x00 {
        return Err(TransportError::connection_failed(
            backend.to_string(),
            format!("backend refused connect, status {}", head[1]),
        ));
    }

    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(TransportError::connection_failed(
                backend.to_string(),
                format!("unknown address type {other} in reply"),
            ));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    conn.read_exact(&mut bound).await?;

    Ok(conn)
}
