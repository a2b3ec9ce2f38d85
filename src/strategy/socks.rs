//! Local SOCKS5 surface shared by the strategy listeners
//!
//! Both strategy families expose a loopback SOCKS5 listener. This module
//! holds the server-side handshake (no-auth only) and the fixed reply
//! frames. Replies always use the IPv4 zero address form; clients only
//! inspect the status byte.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::StrategyError;

/// SOCKS protocol version
pub const SOCKS_VERSION: u8 = 0x05;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Reply: succeeded
pub const REPLY_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Reply: general SOCKS server failure
pub const REPLY_GENERAL_FAILURE: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Reply: command not supported
pub const REPLY_COMMAND_UNSUPPORTED: [u8; 10] = [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Requested command (CONNECT or UDP ASSOCIATE)
    pub command: u8,
    /// Target host (domain or IP literal)
    pub host: String,
    /// Target port
    pub port: u16,
}

impl ClientRequest {
    /// `host:port` form for stream metadata
    #[must_use]
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Run the server side of a SOCKS5 handshake and read one request.
///
/// # Errors
///
/// Returns `StrategyError::IoError` on socket failures and a remote-refused
/// error on protocol violations (wrong version, bad address type).
pub async fn handshake(stream: &mut TcpStream) -> Result<ClientRequest, StrategyError> {
    // Greeting
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(StrategyError::RemoteRefused(format!(
            "unsupported socks version {}",
            head[0]
        )));
    }
    let n_methods = head[1] as usize;
    if n_methods > 0 {
        let mut methods = vec![0u8; n_methods];
        stream.read_exact(&mut methods).await?;
    }
    stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // Request: VER CMD RSV ATYP
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(StrategyError::RemoteRefused("bad request version".into()));
    }
    let command = req[1];

    let host = match req[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| StrategyError::RemoteRefused("domain is not UTF-8".into()))?
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr).to_string()
        }
        other => {
            return Err(StrategyError::RemoteRefused(format!(
                "unsupported address type {other}"
            )));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(ClientRequest {
        command,
        host,
        port,
    })
}

/// Build the UDP ASSOCIATE success reply carrying the relay address
#[must_use]
pub fn udp_associate_reply(relay: SocketAddr) -> Vec<u8> {
    let mut reply = vec![0x05, 0x00, 0x00];
    match relay.ip() {
        IpAddr::V4(v4) => {
            reply.push(0x01);
            reply.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            reply.push(0x04);
            reply.extend_from_slice(&v6.octets());
        }
    }
    reply.extend_from_slice(&relay.port().to_be_bytes());
    reply
}
