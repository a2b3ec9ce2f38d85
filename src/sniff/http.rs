//! HTTP request sniffing
//!
//! Parses the request line and headers of an HTTP/1.x request far enough to
//! determine the routing target. Only the Host information is honoured:
//! `CONNECT host:port` uses the authority form, everything else uses the
//! Host header with port 80 as the default (443 for CONNECT without an
//! explicit port). The request bytes stay in the buffer so the proxy path
//! can replay them.

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::trace;

use super::{fill, Protocol, SniffResult};
use crate::error::SniffError;

/// Maximum number of headers worth inspecting
const MAX_HEADERS: usize = 64;

/// Cap on how many prefix bytes are buffered while hunting for headers
const MAX_REQUEST_PREFIX: usize = 16 * 1024 - 1024;

/// Sniff an HTTP connection: buffer until the header block parses, then
/// extract the target host and port.
pub(super) async fn sniff_http(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<SniffResult, SniffError> {
    loop {
        match parse_http_target(buf) {
            Ok(Some((host, port, is_connect))) => {
                trace!(host = %host, port, is_connect, "HTTP request sniffed");
                return Ok(SniffResult {
                    protocol: Protocol::Http,
                    host,
                    port,
                    socks_command: 0,
                    http_is_connect: is_connect,
                });
            }
            Ok(None) => {
                if buf.len() >= MAX_REQUEST_PREFIX {
                    return Err(SniffError::malformed(
                        "http",
                        "header block exceeds sniff window",
                    ));
                }
                // Headers incomplete, pull in more bytes
                fill(stream, buf, buf.len() + 1).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Try to parse an HTTP request prefix.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((host, port,
/// is_connect)))` once the target is known.
///
/// # Errors
///
/// Returns `SniffError::Malformed` for unparsable requests or requests
/// without any usable host.
pub fn parse_http_target(data: &[u8]) -> Result<Option<(String, u16, bool)>, SniffError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let complete = match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => true,
        Ok(httparse::Status::Partial) => false,
        Err(e) => {
            return Err(SniffError::malformed("http", e.to_string()));
        }
    };

    let method = req.method.unwrap_or("");
    let is_connect = method.eq_ignore_ascii_case("CONNECT");

    // CONNECT carries the authority directly in the request target
    if is_connect {
        if let Some(path) = req.path {
            let (host, port) = split_host_port(path, 443);
            if !host.is_empty() {
                return Ok(Some((host, port, true)));
            }
        }
    }

    // Everything else routes on the Host header
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| SniffError::malformed("http", "Host header is not UTF-8"))?
                .trim();
            let default_port = if is_connect { 443 } else { 80 };
            let (host, port) = split_host_port(value, default_port);
            if host.is_empty() {
                return Err(SniffError::malformed("http", "empty Host header"));
            }
            return Ok(Some((host, port, is_connect)));
        }
    }

    if complete {
        return Err(SniffError::malformed("http", "request has no Host header"));
    }
    Ok(None)
}

/// Split `host[:port]`, handling bracketed IPv6 literals
fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = value.strip_prefix('[') {
        // [::1]:8080 or [::1]
        if let Some(bracket_end) = rest.find(']') {
            let host = rest[..bracket_end].to_string();
            let port = rest[bracket_end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
        return (value.to_string(), default_port);
    }

    match value.rsplit_once(':') {
        Some((host, port_str)) if port_str.chars().all(|c| c.is_ascii_digit()) => {
            match port_str.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (host.to_string(), default_port),
            }
        }
        _ => (value.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_get() {
        let data = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (host, port, is_connect) = parse_http_target(data).unwrap().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert!(!is_connect);
    }

    #[test]
    fn test_parse_host_with_port() {
        let data = b"POST /api HTTP/1.1\r\nHost: api.example.com:8443\r\n\r\n";
        let (host, port, _) = parse_http_target(data).unwrap().unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_connect_authority() {
        let data = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (host, port, is_connect) = parse_http_target(data).unwrap().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert!(is_connect);
    }

    #[test]
    fn test_parse_connect_default_port() {
        let data = b"CONNECT example.com HTTP/1.1\r\n\r\n";
        let (host, port, is_connect) = parse_http_target(data).unwrap().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert!(is_connect);
    }

    #[test]
    fn test_parse_partial_needs_more() {
        let data = b"GET / HTTP/1.1\r\nUser-Agent: cu";
        assert_eq!(parse_http_target(data).unwrap(), None);
    }

    #[test]
    fn test_partial_with_host_already_usable() {
        // Host is visible even though the header block is not yet complete
        let data = b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept: */";
        let parsed = parse_http_target(data).unwrap();
        assert_eq!(parsed, Some(("example.com".to_string(), 80, false)));
    }

    #[test]
    fn test_parse_no_host_is_error() {
        let data = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(parse_http_target(data).is_err());
    }

    #[test]
    fn test_parse_garbage_is_error() {
        let data = b"G\x00T / HTTP/1.1\r\n\r\n";
        assert!(parse_http_target(data).is_err());
    }

    #[test]
    fn test_split_host_port_ipv6() {
        assert_eq!(split_host_port("[::1]:8080", 80), ("::1".to_string(), 8080));
        assert_eq!(split_host_port("[2001:db8::1]", 80), ("2001:db8::1".to_string(), 80));
        assert_eq!(split_host_port("192.168.1.1:81", 80), ("192.168.1.1".to_string(), 81));
        assert_eq!(split_host_port("plain.example.com", 80), ("plain.example.com".to_string(), 80));
    }
}
