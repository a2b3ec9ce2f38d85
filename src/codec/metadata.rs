//! Stream-open metadata
//!
//! The payload of a `NewStreamTcp` packet describes the connect target in a
//! SOCKS5-like shape:
//!
//! ```text
//! u8 CMD (1=connect) || u8 ATYP (1=IPv4, 3=domain, 4=IPv6) ||
//! [u8 domain_len] || ADDR || u16 BE PORT
//! ```

use std::net::IpAddr;

use crate::error::CodecError;

/// CONNECT command byte
pub const CMD_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Parsed stream-open target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    /// Command byte (currently always [`CMD_CONNECT`])
    pub cmd: u8,
    /// Target host (domain or textual IP)
    pub host: String,
    /// Target port
    pub port: u16,
}

impl StreamTarget {
    /// `host:port` form, bracketing IPv6 addresses
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Build `NewStreamTcp` metadata for `host:port`.
///
/// IP literals are encoded in their binary ATYP forms; anything else goes
/// out as a length-prefixed domain.
#[must_use]
pub fn build_stream_metadata(cmd: u8, host: &str, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(host.len() + 8);
    buf.push(cmd);

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            buf.push(ATYP_DOMAIN);
            // Domains longer than 255 bytes cannot be encoded; truncation
            // would silently corrupt the target, so cap hard here.
            let bytes = host.as_bytes();
            let len = bytes.len().min(255);
            buf.push(len as u8);
            buf.extend_from_slice(&bytes[..len]);
        }
    }

    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Parse `NewStreamTcp` metadata.
///
/// # Errors
///
/// Returns `CodecError::BadMetadata` for short or malformed payloads.
pub fn parse_stream_metadata(payload: &[u8]) -> Result<StreamTarget, CodecError> {
    if payload.len() < 2 {
        return Err(CodecError::bad_metadata("missing command/address type"));
    }
    let cmd = payload[0];
    let atyp = payload[1];

    let (host, port_off) = match atyp {
        ATYP_IPV4 => {
            if payload.len() < 2 + 4 + 2 {
                return Err(CodecError::bad_metadata("short IPv4 address"));
            }
            let octets: [u8; 4] = payload[2..6].try_into().expect("length checked");
            (IpAddr::from(octets).to_string(), 6)
        }
        ATYP_DOMAIN => {
            if payload.len() < 3 {
                return Err(CodecError::bad_metadata("missing domain length"));
            }
            let len = payload[2] as usize;
            if payload.len() < 3 + len + 2 {
                return Err(CodecError::bad_metadata("short domain"));
            }
            let host = std::str::from_utf8(&payload[3..3 + len])
                .map_err(|_| CodecError::bad_metadata("domain is not UTF-8"))?
                .to_string();
            (host, 3 + len)
        }
        ATYP_IPV6 => {
            if payload.len() < 2 + 16 + 2 {
                return Err(CodecError::bad_metadata("short IPv6 address"));
            }
            let octets: [u8; 16] = payload[2..18].try_into().expect("length checked");
            (IpAddr::from(octets).to_string(), 18)
        }
        other => {
            return Err(CodecError::bad_metadata(format!(
                "unsupported address type {other:#04x}"
            )));
        }
    };

    let port = u16::from_be_bytes([payload[port_off], payload[port_off + 1]]);
    Ok(StreamTarget { cmd, host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_metadata() {
        let meta = build_stream_metadata(CMD_CONNECT, "example.com", 443);
        assert_eq!(
            meta,
            [
                &[0x01, 0x03, 0x0b][..],
                b"example.com",
                &[0x01, 0xbb][..],
            ]
            .concat()
        );

        let target = parse_stream_metadata(&meta).unwrap();
        assert_eq!(target.cmd, CMD_CONNECT);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.address(), "example.com:443");
    }

    #[test]
    fn test_ipv4_metadata() {
        let meta = build_stream_metadata(CMD_CONNECT, "192.168.1.1", 8080);
        assert_eq!(meta[1], 0x01);
        let target = parse_stream_metadata(&meta).unwrap();
        assert_eq!(target.host, "192.168.1.1");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn test_ipv6_metadata() {
        let meta = build_stream_metadata(CMD_CONNECT, "2001:db8::1", 53);
        assert_eq!(meta[1], 0x04);
        let target = parse_stream_metadata(&meta).unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.address(), "[2001:db8::1]:53");
    }

    #[test]
    fn test_malformed_metadata() {
        assert!(parse_stream_metadata(&[]).is_err());
        assert!(parse_stream_metadata(&[0x01]).is_err());
        // Declared domain length longer than the payload
        assert!(parse_stream_metadata(&[0x01, 0x03, 0x20, b'a', b'b']).is_err());
        // Unknown address type
        assert!(parse_stream_metadata(&[0x01, 0x02, 0, 0, 0, 0, 0, 80]).is_err());
    }
}
