//! Per-request tunnel strategy
//!
//! Every accepted local connection gets its own short-lived transport to
//! the remote endpoint. The uplink is AEAD-sealed (AES-256-GCM); the
//! downlink arrives as plaintext framed packets, with confidentiality
//! delegated to the outer TLS of the `wss://` transport. A single stream
//! id (1) is used since the transport carries exactly one stream.
//!
//! UDP ASSOCIATE is refused on this family: there is no persistent tunnel
//! to aggregate datagrams onto.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::socks::{
    self, CMD_CONNECT, REPLY_COMMAND_UNSUPPORTED, REPLY_GENERAL_FAILURE, REPLY_SUCCESS,
};
use super::{transport_config, StrategyKind, TunnelStrategy};
use crate::app::status;
use crate::codec::{self, build_stream_metadata, Packet, PacketFlag};
use crate::crypto::{Algorithm, Cipher};
use crate::error::StrategyError;
use crate::state::{Metrics, ServerProfile};
use crate::transport::{self, WsByteStream};

/// The only stream id on a per-request transport
const SINGLE_STREAM_ID: u16 = 1;

/// How long to wait for the remote's stream confirmation
const SUCCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream copy chunk size
const COPY_BUFFER: usize = 16 * 1024;

struct Inner {
    profile: parking_lot::RwLock<Arc<ServerProfile>>,
    crypt_key: u32,
    listen_addr: parking_lot::Mutex<Option<SocketAddr>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    active_connections: AtomicI64,
    closed: AtomicBool,
    shutdown: Notify,
}

/// Short-lived tunnel-per-connection strategy
pub struct PerRequestStrategy {
    inner: Arc<Inner>,
}

impl PerRequestStrategy {
    /// Create an uninitialized strategy for `profile`
    pub fn new(profile: Arc<ServerProfile>, crypt_key: u32) -> Arc<dyn TunnelStrategy> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                profile: parking_lot::RwLock::new(profile),
                crypt_key,
                listen_addr: parking_lot::Mutex::new(None),
                accept_task: parking_lot::Mutex::new(None),
                active_connections: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        })
    }
}

impl Inner {
    fn profile(&self) -> Arc<ServerProfile> {
        self.profile.read().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Dial a fresh transport and build the uplink cipher
    async fn create_tunnel(&self) -> Result<(WsByteStream, Cipher), StrategyError> {
        let profile = self.profile();
        let config = transport_config(&profile);
        let stream = transport::connect(&config).await?;
        let cipher = Cipher::new(self.crypt_key, Algorithm::Aes256Gcm)
            .map_err(|e| StrategyError::NotReady(format!("cipher setup failed: {e}")))?;
        Ok((stream, cipher))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    warn!(error = %e, "Per-request listener accept failed");
                    continue;
                }
            };
            if self.is_closed() {
                return;
            }

            self.active_connections.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = inner.handle_client(stream).await {
                    debug!(peer = %peer, error = %e, "Per-request session ended with error");
                }
                inner.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_client(&self, mut stream: TcpStream) -> Result<(), StrategyError> {
        let request = socks::handshake(&mut stream).await?;

        if request.command != CMD_CONNECT {
            // No persistent tunnel to hang an association on
            stream
                .write_all(&REPLY_COMMAND_UNSUPPORTED)
                .await
                .map_err(StrategyError::IoError)?;
            return Err(StrategyError::RemoteRefused(format!(
                "unsupported SOCKS5 command {}",
                request.command
            )));
        }

        let (tunnel, cipher) = match self.create_tunnel().await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
                return Err(e);
            }
        };
        let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

        // Encrypted stream-open on the fixed id
        let metadata = build_stream_metadata(codec::CMD_CONNECT, &request.host, request.port);
        let open = Packet::new(SINGLE_STREAM_ID, PacketFlag::NewStreamTcp, metadata);
        codec::write_packet(&mut tunnel_write, &open, Some(&cipher)).await?;

        // The confirmation comes back unencrypted
        match timeout(SUCCESS_TIMEOUT, codec::read_packet(&mut tunnel_read, None)).await {
            Ok(Ok(packet)) if packet.flag == PacketFlag::NewStreamTcpSuccess => {}
            Ok(Ok(packet)) => {
                let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
                return Err(StrategyError::RemoteRefused(format!(
                    "unexpected flag {:?} instead of stream confirmation",
                    packet.flag
                )));
            }
            Ok(Err(e)) => {
                let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
                return Err(StrategyError::StreamOpenTimeout {
                    timeout_secs: SUCCESS_TIMEOUT.as_secs(),
                });
            }
        }

        stream
            .write_all(&REPLY_SUCCESS)
            .await
            .map_err(StrategyError::IoError)?;
        status::set(format!(
            "Connected (per-request via {})",
            self.profile().address
        ));

        let (mut client_read, mut client_write) = stream.into_split();

        let result = tokio::select! {
            res = uplink(&cipher, &mut client_read, &mut tunnel_write) => res,
            res = downlink(&mut tunnel_read, &mut client_write) => res,
            () = self.shutdown.notified() => Ok(()),
        };

        // Best-effort close toward the remote; both sides drop on return
        let close = Packet::control(SINGLE_STREAM_ID, PacketFlag::CloseStream);
        let _ = codec::write_packet(&mut tunnel_write, &close, Some(&cipher)).await;

        result
    }
}

/// Client -> remote: chunks are sealed into `TcpData` packets
async fn uplink(
    cipher: &Cipher,
    client_read: &mut tokio::net::tcp::OwnedReadHalf,
    tunnel_write: &mut WriteHalf<WsByteStream>,
) -> Result<(), StrategyError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = client_read
            .read(&mut buf)
            .await
            .map_err(StrategyError::IoError)?;
        if n == 0 {
            return Ok(());
        }
        let packet = Packet::new(SINGLE_STREAM_ID, PacketFlag::TcpData, buf[..n].to_vec());
        codec::write_packet(tunnel_write, &packet, Some(cipher)).await?;
    }
}

/// Remote -> client: plaintext framed packets are unwrapped onto the socket
async fn downlink(
    tunnel_read: &mut ReadHalf<WsByteStream>,
    client_write: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), StrategyError> {
    loop {
        let packet = codec::read_packet(tunnel_read, None).await?;
        match packet.flag {
            PacketFlag::TcpData => {
                client_write
                    .write_all(&packet.payload)
                    .await
                    .map_err(StrategyError::IoError)?;
            }
            PacketFlag::CloseStream => return Ok(()),
            other => {
                return Err(StrategyError::RemoteRefused(format!(
                    "unexpected flag {other:?} on per-request downlink"
                )));
            }
        }
    }
}

#[async_trait]
impl TunnelStrategy for PerRequestStrategy {
    async fn initialize(&self) -> Result<(), StrategyError> {
        let local_port = self.inner.profile().local_port;
        let addr = format!("127.0.0.1:{local_port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| StrategyError::bind(&addr, e.to_string()))?;
        let bound = listener.local_addr().map_err(StrategyError::IoError)?;
        *self.inner.listen_addr.lock() = Some(bound);

        info!(listen_addr = %bound, strategy = "per-request", "Strategy listener started");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.accept_loop(listener).await;
        });
        *self.inner.accept_task.lock() = Some(task);
        Ok(())
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock()
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::PerRequest
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(listen_addr = ?self.listen_addr(), "Closing per-request strategy");
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        self.inner.shutdown.notify_waiters();
    }

    fn update_profile(&self, _profile: Arc<ServerProfile>) -> Result<(), StrategyError> {
        // Connections are one-shot; the controller rebuilds the instance
        Err(StrategyError::HotUpdateUnsupported)
    }

    async fn check_health(&self) -> Result<(), StrategyError> {
        // A successful dial is the probe; the connection is discarded
        let (tunnel, _cipher) = self.inner.create_tunnel().await?;
        drop(tunnel);
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        Metrics {
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            latency_ms: -1,
        }
    }
}
