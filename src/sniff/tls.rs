//! TLS ClientHello SNI extraction
//!
//! Walks a TLS handshake record far enough to find the `server_name`
//! extension (type 0x0000) and returns the first host name. The record is
//! peeked, never consumed: the opaque forwarding path replays it to the
//! selected backend.
//!
//! ```text
//! ContentType (1) = 0x16
//! ProtocolVersion (2)
//! Length (2)
//! HandshakeType (1) = 0x01
//! Length (3)
//! ProtocolVersion (2)
//! Random (32)
//! SessionID (1 + n)
//! CipherSuites (2 + n)
//! CompressionMethods (1 + n)
//! Extensions (2 + n)
//! ```

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::trace;

use super::{fill, Protocol, SniffResult};
use crate::error::SniffError;

/// TLS `ContentType` for handshake records
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// TLS `HandshakeType` for ClientHello
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// TLS record header size
const TLS_RECORD_HEADER_SIZE: usize = 5;

/// SNI extension type
const TLS_EXTENSION_TYPE_SNI: u16 = 0x0000;

/// SNI name type for host names
const TLS_SNI_NAME_TYPE_HOSTNAME: u8 = 0x00;

/// RFC 5246 caps a TLS record fragment at 2^14 bytes
const MAX_TLS_RECORD_LEN: usize = 16384;

/// Sniff a TLS connection: buffer the full ClientHello record and extract
/// the SNI host name. TLS carries no port information, so the target port
/// is fixed at 443.
pub(super) async fn sniff_tls(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<SniffResult, SniffError> {
    fill(stream, buf, TLS_RECORD_HEADER_SIZE).await?;

    if buf[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return Err(SniffError::malformed("tls", "not a handshake record"));
    }
    if buf[1] != 0x03 {
        return Err(SniffError::malformed(
            "tls",
            format!("unexpected major version {}", buf[1]),
        ));
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len == 0 || record_len > MAX_TLS_RECORD_LEN {
        return Err(SniffError::malformed(
            "tls",
            format!("record length {record_len} out of range"),
        ));
    }

    fill(stream, buf, TLS_RECORD_HEADER_SIZE + record_len).await?;

    let host = extract_sni(&buf[TLS_RECORD_HEADER_SIZE..TLS_RECORD_HEADER_SIZE + record_len])?;
    trace!(sni = %host, "TLS ClientHello sniffed");

    Ok(SniffResult {
        protocol: Protocol::Tls,
        host,
        port: 443,
        socks_command: 0,
        http_is_connect: false,
    })
}

/// Extract the SNI host name from a ClientHello handshake body.
///
/// # Errors
///
/// Returns `SniffError::Malformed` if the hello cannot be walked or no SNI
/// extension is present.
pub fn extract_sni(handshake: &[u8]) -> Result<String, SniffError> {
    if handshake.len() < 42 {
        return Err(SniffError::malformed("tls", "ClientHello too short"));
    }
    if handshake[0] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniffError::malformed("tls", "not a ClientHello"));
    }

    // Skip: type (1) + length (3) + version (2) + random (32)
    let mut pos: usize = 38;

    // Session ID
    if pos >= handshake.len() {
        return Err(SniffError::malformed("tls", "truncated at session id"));
    }
    let session_id_len = handshake[pos] as usize;
    pos += 1 + session_id_len;

    // Cipher suites
    if pos + 2 > handshake.len() {
        return Err(SniffError::malformed("tls", "truncated at cipher suites"));
    }
    let cipher_suites_len = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    // Compression methods
    if pos >= handshake.len() {
        return Err(SniffError::malformed("tls", "truncated at compression"));
    }
    let compression_len = handshake[pos] as usize;
    pos += 1 + compression_len;

    // Extensions
    if pos + 2 > handshake.len() {
        return Err(SniffError::malformed("tls", "no extensions present"));
    }
    let extensions_len = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]) as usize;
    pos += 2;
    if pos + extensions_len > handshake.len() {
        return Err(SniffError::malformed("tls", "extensions length mismatch"));
    }

    let extensions_end = pos + extensions_len;
    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]);
        let ext_len = u16::from_be_bytes([handshake[pos + 2], handshake[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return Err(SniffError::malformed("tls", "extension overruns record"));
        }

        if ext_type == TLS_EXTENSION_TYPE_SNI {
            return parse_sni_extension(&handshake[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    Err(SniffError::malformed("tls", "SNI extension not found"))
}

/// Parse the server-name list inside the SNI extension
fn parse_sni_extension(data: &[u8]) -> Result<String, SniffError> {
    if data.len() < 5 {
        return Err(SniffError::malformed("tls", "SNI extension too short"));
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = (2 + list_len).min(data.len());
    let mut pos: usize = 2;

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > data.len() {
            return Err(SniffError::malformed("tls", "SNI name overruns extension"));
        }

        if name_type == TLS_SNI_NAME_TYPE_HOSTNAME {
            let name = &data[pos..pos + name_len];
            if name.is_empty() || !name.iter().all(|&b| b.is_ascii() && b != 0) {
                return Err(SniffError::malformed("tls", "SNI host is not ASCII"));
            }
            return Ok(String::from_utf8_lossy(name).into_owned());
        }
        pos += name_len;
    }

    Err(SniffError::malformed("tls", "no host_name entry in SNI"))
}

#[cfg(test)]
pub(crate) fn build_client_hello(sni: &str) -> Vec<u8> {
    let mut hello = Vec::new();

    // ClientHello body
    hello.extend_from_slice(&[0x03, 0x03]); // version TLS 1.2
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0x00); // empty session id
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    hello.extend_from_slice(&[0x01, 0x00]); // null compression

    // SNI extension
    let name = sni.as_bytes();
    let entry_len = 3 + name.len();
    let ext_body_len = 2 + entry_len;
    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // type
    extensions.extend_from_slice(&(ext_body_len as u16).to_be_bytes());
    extensions.extend_from_slice(&(entry_len as u16).to_be_bytes()); // list len
    extensions.push(0x00); // host_name
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);

    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    // Handshake header
    let mut handshake = vec![0x01];
    let body_len = hello.len();
    handshake.push((body_len >> 16) as u8);
    handshake.push((body_len >> 8) as u8);
    handshake.push(body_len as u8);
    handshake.extend_from_slice(&hello);

    // Record header
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
