//! WebSocket dial and byte-stream adapter
//!
//! The dial path runs TCP connect (honouring the edge-ip override), an
//! optional TLS handshake, and the WebSocket upgrade, each bounded by the
//! configured connect timeout. The resulting [`WsByteStream`] converts the
//! binary-message stream into `AsyncRead`/`AsyncWrite` so the packet codec
//! can run on top of it: reads coalesce one message at a time into an
//! internal buffer and drain it before requesting the next; each write
//! emits one binary message (the caller's buffer is copied).
//!
//! Non-binary data frames are a protocol violation on a tunnel and fail the
//! read; pings, pongs, and empty binary messages are skipped.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::sink::Sink;
use futures::stream::Stream;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use super::{TlsConfig, TransportConfig, USER_AGENT};
use crate::error::TransportError;

type WsStreamPlain = WebSocketStream<TcpStream>;
type WsStreamTls = WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

enum WsStreamInner {
    Plain(WsStreamPlain),
    Tls(WsStreamTls),
}

/// Resolve the dial address (edge ip or hostname) to socket addresses
async fn resolve_address(config: &TransportConfig) -> Result<Vec<SocketAddr>, TransportError> {
    let addr_str = config.dial_address();

    if let Ok(addr) = addr_str.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }

    let addrs: Vec<SocketAddr> = lookup_host(&addr_str)
        .await
        .map_err(|e| TransportError::dns_failed(&addr_str, e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::dns_failed(&addr_str, "no addresses returned"));
    }

    Ok(addrs)
}

/// Configure TCP socket options
fn configure_socket(stream: &TcpStream, config: &TransportConfig) -> Result<(), TransportError> {
    if config.tcp_nodelay {
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::socket_option("TCP_NODELAY", e.to_string()))?;
    }

    if config.tcp_keepalive {
        let socket_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(20));

        #[cfg(target_os = "linux")]
        let keepalive = keepalive.with_retries(3);

        socket_ref
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| TransportError::socket_option("TCP_KEEPALIVE", e.to_string()))?;
    }

    Ok(())
}

/// Create the rustls client configuration
fn create_tls_config(tls_config: &TlsConfig) -> rustls::ClientConfig {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    /// Accept-anything verifier for skip-verify mode
    #[derive(Debug)]
    struct InsecureServerCertVerifier;

    impl ServerCertVerifier for InsecureServerCertVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    if tls_config.skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    }
}

/// Build the WebSocket upgrade request.
///
/// The Host header always carries the logical hostname even when the TCP
/// connection goes to an edge ip.
fn build_request(config: &TransportConfig) -> Result<Request<()>, TransportError> {
    let scheme = if config.tls.is_some() { "wss" } else { "ws" };
    let url = format!(
        "{scheme}://{}:{}{}",
        config.address, config.port, config.websocket.path
    );

    let mut builder = Request::builder()
        .uri(&url)
        .header("Host", &config.address)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("User-Agent", USER_AGENT);

    for (name, value) in &config.websocket.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(())
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

async fn dial_tcp(
    addr: SocketAddr,
    config: &TransportConfig,
) -> Result<TcpStream, TransportError> {
    let connect_timeout = config.connect_timeout;
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::timeout(addr.to_string(), connect_timeout.as_millis() as u64))?
        .map_err(|e| TransportError::connection_failed(addr.to_string(), e.to_string()))?;
    configure_socket(&stream, config)?;
    Ok(stream)
}

async fn connect_tls(
    addr: SocketAddr,
    config: &TransportConfig,
    tls_config: &TlsConfig,
    request: Request<()>,
) -> Result<WsStreamInner, TransportError> {
    let connect_timeout = config.connect_timeout;
    let tcp_stream = dial_tcp(addr, config).await?;

    let connector = TlsConnector::from(Arc::new(create_tls_config(tls_config)));

    let server_name: rustls::pki_types::ServerName<'static> = tls_config
        .server_name
        .clone()
        .try_into()
        .map_err(|_| TransportError::InvalidServerName(tls_config.server_name.clone()))?;

    let tls_stream = timeout(connect_timeout, connector.connect(server_name, tcp_stream))
        .await
        .map_err(|_| {
            TransportError::timeout(
                format!("TLS handshake to {addr}"),
                connect_timeout.as_millis() as u64,
            )
        })?
        .map_err(|e| TransportError::tls_handshake(&tls_config.server_name, e.to_string()))?;

    let (ws_stream, _response) = timeout(
        connect_timeout,
        tokio_tungstenite::client_async(request, tls_stream),
    )
    .await
    .map_err(|_| {
        TransportError::timeout(
            format!("WebSocket handshake to {addr}"),
            connect_timeout.as_millis() as u64,
        )
    })?
    .map_err(|e| TransportError::websocket_handshake(e.to_string()))?;

    Ok(WsStreamInner::Tls(ws_stream))
}

async fn connect_plain(
    addr: SocketAddr,
    config: &TransportConfig,
    request: Request<()>,
) -> Result<WsStreamInner, TransportError> {
    let connect_timeout = config.connect_timeout;
    let tcp_stream = dial_tcp(addr, config).await?;

    let (ws_stream, _response) = timeout(
        connect_timeout,
        tokio_tungstenite::client_async(request, tcp_stream),
    )
    .await
    .map_err(|_| {
        TransportError::timeout(
            format!("WebSocket handshake to {addr}"),
            connect_timeout.as_millis() as u64,
        )
    })?
    .map_err(|e| TransportError::websocket_handshake(e.to_string()))?;

    Ok(WsStreamInner::Plain(ws_stream))
}

/// Connect to a remote endpoint, trying each resolved address in turn.
pub(super) async fn connect(config: &TransportConfig) -> Result<WsByteStream, TransportError> {
    let addrs = resolve_address(config).await?;

    let mut last_error = None;
    for addr in addrs {
        let request = build_request(config)?;

        let result = if let Some(tls_config) = &config.tls {
            connect_tls(addr, config, tls_config, request).await
        } else {
            connect_plain(addr, config, request).await
        };

        match result {
            Ok(inner) => {
                tracing::debug!(
                    addr = %addr,
                    host = %config.address,
                    path = %config.websocket.path,
                    tls = config.tls.is_some(),
                    edge_ip = config.edge_ip.as_deref().unwrap_or(""),
                    "WebSocket tunnel transport established"
                );
                return Ok(WsByteStream::new(inner));
            }
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Transport dial attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TransportError::connection_failed(config.address_string(), "no addresses to connect to")
    }))
}

/// Byte-stream adapter over a WebSocket binary-message channel
///
/// # Message handling
///
/// - **Read**: binary messages are buffered and drained as bytes; a close
///   frame or stream end reads as EOF
/// - **Write**: each call sends one binary message
/// - **Ping/Pong**: skipped (tungstenite answers pings internally)
/// - **Text/other**: fails the read — a tunnel peer never sends these
pub struct WsByteStream {
    inner: WsStreamInner,
    read_buffer: BytesMut,
}

impl WsByteStream {
    fn new(inner: WsStreamInner) -> Self {
        Self {
            inner,
            read_buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Fill `buf` from `data`, stashing any overflow in the read buffer
    fn deliver(&mut self, data: &[u8], buf: &mut ReadBuf<'_>) {
        let to_copy = data.len().min(buf.remaining());
        buf.put_slice(&data[..to_copy]);
        if to_copy < data.len() {
            self.read_buffer.extend_from_slice(&data[to_copy..]);
        }
    }
}

impl std::fmt::Debug for WsByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsByteStream")
            .field("buffered", &self.read_buffer.len())
            .finish()
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Drain any previously buffered bytes first
        if !this.read_buffer.is_empty() {
            let to_copy = this.read_buffer.len().min(buf.remaining());
            buf.put_slice(&this.read_buffer[..to_copy]);
            this.read_buffer.advance(to_copy);
            return Poll::Ready(Ok(()));
        }

        loop {
            let poll_result = match &mut this.inner {
                WsStreamInner::Plain(stream) => Pin::new(stream).poll_next(cx),
                WsStreamInner::Tls(stream) => Pin::new(stream).poll_next(cx),
            };

            match poll_result {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    if data.is_empty() {
                        continue;
                    }
                    this.deliver(&data, buf);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {
                    continue;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    // EOF: leave buf untouched
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "non-binary message on tunnel transport",
                    )));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let ready = match &mut this.inner {
            WsStreamInner::Plain(stream) => Pin::new(stream).poll_ready(cx),
            WsStreamInner::Tls(stream) => Pin::new(stream).poll_ready(cx),
        };
        match ready {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
            }
            Poll::Pending => return Poll::Pending,
        }

        // One binary message per write; the payload is copied out of the
        // caller's buffer
        let message = Message::Binary(buf.to_vec());
        let sent = match &mut this.inner {
            WsStreamInner::Plain(stream) => Pin::new(stream).start_send(message),
            WsStreamInner::Tls(stream) => Pin::new(stream).start_send(message),
        };

        match sent {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match &mut this.inner {
            WsStreamInner::Plain(stream) => Pin::new(stream).poll_flush(cx),
            WsStreamInner::Tls(stream) => Pin::new(stream).poll_flush(cx),
        };
        result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match &mut this.inner {
            WsStreamInner::Plain(stream) => Pin::new(stream).poll_close(cx),
            WsStreamInner::Tls(stream) => Pin::new(stream).poll_close(cx),
        };
        result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WebSocketConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_build_request_plain() {
        let config = TransportConfig::ws("example.com", 80, "/ws");
        let request = build_request(&config).unwrap();
        let uri = request.uri().to_string();
        assert!(uri.starts_with("ws://"));
        assert!(uri.contains("/ws"));
        assert_eq!(
            request.headers().get("User-Agent").unwrap().to_str().unwrap(),
            USER_AGENT
        );
        assert_eq!(
            request.headers().get("Host").unwrap().to_str().unwrap(),
            "example.com"
        );
    }

    #[test]
    fn test_build_request_tls_scheme() {
        let config =
            TransportConfig::ws("example.com", 443, "/tunnel").with_tls(TlsConfig::new("example.com"));
        let request = build_request(&config).unwrap();
        assert!(request.uri().to_string().starts_with("wss://"));
    }

    #[test]
    fn test_build_request_edge_ip_keeps_host() {
        let config = TransportConfig::ws("cdn.example.com", 443, "/t")
            .with_tls(TlsConfig::new("cdn.example.com"))
            .with_edge_ip("203.0.113.9");
        let request = build_request(&config).unwrap();
        // The upgrade request never leaks the edge address
        assert_eq!(
            request.headers().get("Host").unwrap().to_str().unwrap(),
            "cdn.example.com"
        );
        assert!(!request.uri().to_string().contains("203.0.113.9"));
    }

    #[test]
    fn test_custom_headers() {
        let mut config = TransportConfig::ws("example.com", 80, "/ws");
        config.websocket = WebSocketConfig::new("/ws").with_header("X-Auth", "token123");
        let request = build_request(&config).unwrap();
        assert_eq!(
            request.headers().get("X-Auth").unwrap().to_str().unwrap(),
            "token123"
        );
    }

    #[tokio::test]
    async fn test_connect_connection_refused() {
        // Port 1 on localhost should refuse promptly
        let config = TransportConfig::ws("127.0.0.1", 1, "/ws")
            .with_timeout(Duration::from_millis(200));
        let result = connect(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_byte_stream_roundtrip_over_local_server() {
        use futures::{SinkExt, StreamExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Echo server: every binary message is sent back verbatim
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    ws.send(Message::Binary(data)).await.unwrap();
                }
            }
        });

        let config = TransportConfig::ws("127.0.0.1", port, "/echo");
        let mut stream = connect(&config).await.unwrap();

        stream.write_all(b"hello over websocket").await.unwrap();
        let mut buf = [0u8; 20];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over websocket");

        // Partial reads drain the internal buffer before the next message
        stream.write_all(b"abcdef").await.unwrap();
        let mut small = [0u8; 2];
        stream.read_exact(&mut small).await.unwrap();
        assert_eq!(&small, b"ab");
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"cdef");

        drop(stream);
        server.abort();
    }
}
