//! The unified gateway acceptor
//!
//! One TCP port accepts SOCKS5, HTTP, and TLS clients. Each accepted
//! connection is traced, sniffed, dispatched, and then carried:
//!
//! - `DIRECT` — splice to the origin (completing the client handshake
//!   locally where the protocol needs one)
//! - rejected — closed silently, except HTTP which gets a `502`
//! - SOCKS5 backend — greeting toward the backend listener, then the
//!   buffered request is replayed and the connection spliced
//! - HTTP/TLS backend — a SOCKS5 CONNECT tunnel is opened to the backend
//!   listener for the sniffed target, then the traffic is spliced
//!   (`200 Connection Established` first for HTTP CONNECT)
//!
//! Every backend path reports success or failure to the reporter, feeding
//! the reactive health checks.

pub mod socks_client;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::BytesMut;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{Decision, Dispatcher};
use crate::error::{DispatchError, GatewayError};
use crate::sniff::{self, Protocol, SniffResult};
use crate::state::FailureReporter;
use crate::strategy::socks::{
    CMD_CONNECT, REPLY_COMMAND_UNSUPPORTED, REPLY_GENERAL_FAILURE, REPLY_SUCCESS,
};

const HTTP_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const HTTP_200: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// The unified-port acceptor
pub struct Gateway {
    listen_port: u16,
    dispatcher: Arc<Dispatcher>,
    reporter: Arc<dyn FailureReporter>,
    listen_addr: parking_lot::Mutex<Option<SocketAddr>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    self_ref: OnceLock<Weak<Gateway>>,
}

impl Gateway {
    /// Create a gateway bound to nothing yet
    pub fn new(
        listen_port: u16,
        dispatcher: Arc<Dispatcher>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Arc<Self> {
        let gateway = Arc::new(Self {
            listen_port,
            dispatcher,
            reporter,
            listen_addr: parking_lot::Mutex::new(None),
            accept_task: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        let _ = gateway.self_ref.set(Arc::downgrade(&gateway));
        gateway
    }

    /// The bound address after [`start`](Self::start)
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Bind the unified port and start accepting.
    ///
    /// # Errors
    ///
    /// A bind failure is fatal for bootstrap and is returned as-is.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        let bound = listener.local_addr()?;
        *self.listen_addr.lock() = Some(bound);
        info!(listen_addr = %bound, "Gateway is listening on unified port");

        if let Some(gateway) = self.self_ref.get().and_then(Weak::upgrade) {
            let task = tokio::spawn(async move {
                gateway.accept_loop(listener).await;
            });
            *self.accept_task.lock() = Some(task);
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    warn!(error = %e, "Gateway failed to accept connection");
                    continue;
                }
            };
            if self.is_closed() {
                return;
            }

            let gateway = Arc::clone(&self);
            tokio::spawn(async move {
                gateway.handle_connection(stream, peer).await;
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting; in-flight connections run to completion
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        info!("Gateway has been shut down");
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let trace_id = Uuid::new_v4();
        let mut buf = BytesMut::with_capacity(4096);

        let sniffed = match sniff::sniff_connection(&mut stream, &mut buf).await {
            Ok(sniffed) => sniffed,
            Err(e) => {
                warn!(trace_id = %trace_id, client = %peer, error = %e, "Could not determine target");
                return;
            }
        };
        debug!(
            trace_id = %trace_id,
            client = %peer,
            protocol = %sniffed.protocol,
            target = %sniffed.target(),
            "Sniffed target for routing"
        );

        let decision = match self
            .dispatcher
            .dispatch(peer, &sniffed.host, sniffed.port)
        {
            Ok(decision) => decision,
            Err(e) => {
                self.refuse(&mut stream, &sniffed, &e).await;
                return;
            }
        };

        match decision {
            Decision::Direct => {
                self.handle_direct(stream, buf, &sniffed, trace_id).await;
            }
            Decision::Backend {
                listen_addr,
                server_id,
            } => match sniffed.protocol {
                Protocol::Socks5 => {
                    self.forward_socks5(stream, buf, listen_addr, &server_id, trace_id)
                        .await;
                }
                Protocol::Http | Protocol::Tls => {
                    self.forward_via_connect(stream, buf, &sniffed, listen_addr, &server_id, trace_id)
                        .await;
                }
            },
        }
    }

    /// Policy refusal: HTTP clients get a 502, everyone else a plain close
    async fn refuse(&self, stream: &mut TcpStream, sniffed: &SniffResult, error: &DispatchError) {
        debug!(target = %sniffed.target(), error = %error, "Dispatch refused connection");
        if sniffed.protocol == Protocol::Http {
            let _ = stream.write_all(HTTP_502).await;
        }
    }

    /// DIRECT: splice to the origin, finishing the local handshake first
    async fn handle_direct(
        &self,
        mut stream: TcpStream,
        buf: BytesMut,
        sniffed: &SniffResult,
        trace_id: Uuid,
    ) {
        if sniffed.protocol == Protocol::Socks5 && sniffed.socks_command != CMD_CONNECT {
            // Direct UDP associate has no relay to offer
            let _ = stream.write_all(&REPLY_COMMAND_UNSUPPORTED).await;
            return;
        }

        let target = sniffed.target();
        let mut origin = match TcpStream::connect(&target).await {
            Ok(origin) => origin,
            Err(e) => {
                debug!(trace_id = %trace_id, target = %target, error = %e, "Direct dial failed");
                match sniffed.protocol {
                    Protocol::Socks5 => {
                        let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
                    }
                    Protocol::Http => {
                        let _ = stream.write_all(HTTP_502).await;
                    }
                    Protocol::Tls => {}
                }
                return;
            }
        };

        let handshake_ok = match sniffed.protocol {
            Protocol::Socks5 => {
                // The buffered request was for us, not the origin
                stream.write_all(&REPLY_SUCCESS).await.is_ok()
            }
            Protocol::Http if sniffed.http_is_connect => {
                stream.write_all(HTTP_200).await.is_ok()
            }
            Protocol::Http | Protocol::Tls => {
                // Replay the sniffed request bytes to the origin
                origin.write_all(&buf).await.is_ok()
            }
        };
        if !handshake_ok {
            return;
        }

        match copy_bidirectional(&mut stream, &mut origin).await {
            Ok((tx, rx)) => {
                debug!(trace_id = %trace_id, target = %target, tx, rx, "Direct splice finished");
            }
            Err(e) => {
                debug!(trace_id = %trace_id, target = %target, error = %e, "Direct splice error");
            }
        }
    }

    /// SOCKS5 client to SOCKS5 backend: handshake, replay, splice
    async fn forward_socks5(
        &self,
        mut stream: TcpStream,
        buf: BytesMut,
        backend_addr: SocketAddr,
        server_id: &str,
        trace_id: Uuid,
    ) {
        let mut backend = match TcpStream::connect(backend_addr).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(trace_id = %trace_id, backend = %backend_addr, error = %e, "Failed to dial backend");
                self.reporter.report_failure(server_id);
                return;
            }
        };
        self.reporter.report_success(server_id);

        // Greeting toward the backend, then replay the client's request
        let handshake = async {
            backend.write_all(&[0x05, 0x01, 0x00]).await?;
            let mut reply = [0u8; 2];
            tokio::io::AsyncReadExt::read_exact(&mut backend, &mut reply).await?;
            if reply != [0x05, 0x00] {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "backend greeting failed",
                ));
            }
            backend.write_all(&buf).await
        };
        if let Err(e) = handshake.await {
            warn!(trace_id = %trace_id, backend = %backend_addr, error = %e, "Backend SOCKS5 handshake failed");
            return;
        }

        match copy_bidirectional(&mut stream, &mut backend).await {
            Ok((tx, rx)) => {
                debug!(trace_id = %trace_id, backend = %backend_addr, tx, rx, "SOCKS5 forward finished");
            }
            Err(e) => {
                debug!(trace_id = %trace_id, backend = %backend_addr, error = %e, "SOCKS5 forward error");
            }
        }
    }

    /// HTTP and TLS clients ride a SOCKS5 CONNECT tunnel to the backend
    async fn forward_via_connect(
        &self,
        mut stream: TcpStream,
        buf: BytesMut,
        sniffed: &SniffResult,
        backend_addr: SocketAddr,
        server_id: &str,
        trace_id: Uuid,
    ) {
        let mut backend =
            match socks_client::connect_via_socks(backend_addr, &sniffed.host, sniffed.port).await
            {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(
                        trace_id = %trace_id,
                        backend = %backend_addr,
                        target = %sniffed.target(),
                        error = %e,
                        "Failed to establish backend tunnel"
                    );
                    self.reporter.report_failure(server_id);
                    if sniffed.protocol == Protocol::Http {
                        let _ = stream.write_all(HTTP_502).await;
                    }
                    return;
                }
            };
        self.reporter.report_success(server_id);

        let prologue_ok = if sniffed.protocol == Protocol::Http && sniffed.http_is_connect {
            // The CONNECT request stays here; the client gets its 200
            stream.write_all(HTTP_200).await.is_ok()
        } else {
            // Plain HTTP request or TLS ClientHello goes through verbatim
            backend.write_all(&buf).await.is_ok()
        };
        if !prologue_ok {
            return;
        }

        match copy_bidirectional(&mut stream, &mut backend).await {
            Ok((tx, rx)) => {
                debug!(
                    trace_id = %trace_id,
                    target = %sniffed.target(),
                    tx, rx,
                    "Proxied session finished"
                );
            }
            Err(e) => {
                debug!(trace_id = %trace_id, target = %sniffed.target(), error = %e, "Proxied session error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RoutingSettings;
    use crate::state::{StateProvider, StateSnapshot};
    use crate::sticky::StickySettings;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    struct EmptyState;
    impl StateProvider for EmptyState {
        fn server_states(&self) -> Arc<StateSnapshot> {
            Arc::new(HashMap::new())
        }
    }

    struct NoopReporter;
    impl FailureReporter for NoopReporter {
        fn report_failure(&self, _server_id: &str) {}
        fn report_success(&self, _server_id: &str) {}
    }

    fn gateway_with_rules(rules: RoutingSettings) -> Arc<Gateway> {
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(EmptyState), &StickySettings::default(), &rules).unwrap(),
        );
        Gateway::new(0, dispatcher, Arc::new(NoopReporter))
    }

    #[tokio::test]
    async fn test_http_reject_gets_502() {
        let rules = RoutingSettings {
            rules: vec![crate::rules::RuleConfig {
                kind: "default".to_string(),
                value: String::new(),
                action: "reject".to_string(),
                backend: String::new(),
                backends: Vec::new(),
            }],
        };
        let gateway = gateway_with_rules(rules);
        gateway.start().await.unwrap();
        let addr = gateway.listen_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 502"));
        gateway.close();
    }

    #[tokio::test]
    async fn test_tls_no_backend_closes_silently() {
        let gateway = gateway_with_rules(RoutingSettings::default());
        gateway.start().await.unwrap();
        let addr = gateway.listen_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let hello = crate::sniff::tls::build_client_hello("example.com");
        client.write_all(&hello).await.unwrap();

        // No eligible backend: socket is just closed
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        gateway.close();
    }

    #[tokio::test]
    async fn test_direct_rule_splices_http() {
        // Origin server that answers one HTTP request
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut req = [0u8; 512];
            let n = stream.read(&mut req).await.unwrap();
            assert!(req[..n].starts_with(b"GET /hello"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let rules = RoutingSettings {
            rules: vec![crate::rules::RuleConfig {
                kind: "default".to_string(),
                value: String::new(),
                action: "direct".to_string(),
                backend: String::new(),
                backends: Vec::new(),
            }],
        };
        let gateway = gateway_with_rules(rules);
        gateway.start().await.unwrap();
        let addr = gateway.listen_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            origin_addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("ok"));
        gateway.close();
    }

    #[tokio::test]
    async fn test_direct_socks5_connect() {
        // Echo origin
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let rules = RoutingSettings {
            rules: vec![crate::rules::RuleConfig {
                kind: "default".to_string(),
                value: String::new(),
                action: "direct".to_string(),
                backend: String::new(),
                backends: Vec::new(),
            }],
        };
        let gateway = gateway_with_rules(rules);
        gateway.start().await.unwrap();
        let addr = gateway.listen_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Greeting + CONNECT to the origin by IPv4
        let mut req = vec![0x05, 0x01, 0x00];
        req.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1]);
        req.extend_from_slice(&origin_addr.port().to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"echo me").await.unwrap();
        let mut echoed = [0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"echo me");
        gateway.close();
    }
}
