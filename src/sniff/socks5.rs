//! SOCKS5 inbound sniffing
//!
//! Unlike the TLS and HTTP sniffers, the SOCKS5 path is interactive: the
//! method negotiation must be answered before the client will send its
//! request. The greeting is consumed and answered here (no-auth only); the
//! request header itself is parsed by peeking and left in the buffer, so
//! the forwarding path can replay it to a backend listener verbatim.

use bytes::{Buf, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

use super::{fill, Protocol, SniffResult};
use crate::error::SniffError;

/// SOCKS protocol version
pub const SOCKS_VERSION: u8 = 0x05;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Sniff a SOCKS5 connection: answer the greeting, peek the request.
///
/// CONNECT and UDP ASSOCIATE are accepted; other commands are rejected as
/// malformed (the gateway replies with "command not supported" downstream).
pub(super) async fn sniff_socks5(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<SniffResult, SniffError> {
    // Greeting: VER NMETHODS METHODS...
    fill(stream, buf, 2).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(SniffError::malformed(
            "socks5",
            format!("unsupported version {}", buf[0]),
        ));
    }
    let n_methods = buf[1] as usize;
    fill(stream, buf, 2 + n_methods).await?;
    buf.advance(2 + n_methods);

    // Reply: no authentication
    stream
        .write_all(&[SOCKS_VERSION, 0x00])
        .await
        .map_err(SniffError::IoError)?;

    // Request header: VER CMD RSV ATYP — peeked, not consumed
    fill(stream, buf, 4).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(SniffError::malformed("socks5", "bad request version"));
    }
    let cmd = buf[1];
    if cmd != CMD_CONNECT && cmd != CMD_UDP_ASSOCIATE {
        return Err(SniffError::malformed(
            "socks5",
            format!("unsupported command {cmd}"),
        ));
    }

    let atyp = buf[3];
    let (host, port) = match atyp {
        ATYP_IPV4 => {
            fill(stream, buf, 4 + 4 + 2).await?;
            let host = std::net::Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]).to_string();
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            (host, port)
        }
        ATYP_DOMAIN => {
            fill(stream, buf, 5).await?;
            let len = buf[4] as usize;
            fill(stream, buf, 5 + len + 2).await?;
            let host = std::str::from_utf8(&buf[5..5 + len])
                .map_err(|_| SniffError::malformed("socks5", "domain is not UTF-8"))?
                .to_string();
            let port = u16::from_be_bytes([buf[5 + len], buf[5 + len + 1]]);
            (host, port)
        }
        ATYP_IPV6 => {
            fill(stream, buf, 4 + 16 + 2).await?;
            let octets: [u8; 16] = buf[4..20].try_into().expect("length checked");
            let host = std::net::Ipv6Addr::from(octets).to_string();
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            (host, port)
        }
        other => {
            return Err(SniffError::malformed(
                "socks5",
                format!("unsupported address type {other}"),
            ));
        }
    };

    trace!(cmd, host = %host, port, "SOCKS5 request sniffed");

    Ok(SniffResult {
        protocol: Protocol::Socks5,
        host,
        port,
        socks_command: cmd,
        http_is_connect: false,
    })
}
