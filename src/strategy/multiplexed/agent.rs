//! Agent: tunnel ownership and the local accept loop
//!
//! The agent owns at most one tunnel at a time. Reconnection is coalesced
//! with a flag and a notifier: the first caller that finds no tunnel
//! becomes the dialer, everyone else parks on the notifier and re-checks.
//! The dial itself runs without any lock held.
//!
//! All writes to the tunnel serialize through one async mutex around the
//! write half, so packet boundaries are atomic; the single read loop task
//! owns the read half outright.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::{self, SessionManager};
use super::udp::UdpManager;
use crate::app::status;
use crate::codec::{self, Packet, PacketFlag};
use crate::crypto::{Algorithm, Cipher};
use crate::error::StrategyError;
use crate::state::ServerProfile;
use crate::strategy::socks::{self, CMD_CONNECT, CMD_UDP_ASSOCIATE, REPLY_COMMAND_UNSUPPORTED};
use crate::strategy::transport_config;
use crate::transport::{self, WsByteStream};

/// A live transport + cipher pair
#[derive(Debug)]
pub(crate) struct Tunnel {
    writer: tokio::sync::Mutex<WriteHalf<WsByteStream>>,
    cipher: Cipher,
    closed: AtomicBool,
}

impl Tunnel {
    /// Write one packet under the tunnel write mutex
    async fn write(&self, packet: &Packet) -> Result<(), StrategyError> {
        let mut writer = self.writer.lock().await;
        codec::write_packet(&mut *writer, packet, Some(&self.cipher))
            .await
            .map_err(StrategyError::from)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Core controller of the multiplexed strategy
pub(crate) struct Agent {
    profile: parking_lot::RwLock<Arc<ServerProfile>>,
    crypt_key: u32,
    pub(crate) buffer_size: usize,

    pub(crate) sessions: SessionManager,
    pub(crate) udp: UdpManager,

    tunnel: parking_lot::Mutex<Option<Arc<Tunnel>>>,
    reconnecting: AtomicBool,
    reconnect_done: Notify,

    listen_addr: parking_lot::Mutex<Option<SocketAddr>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    active_connections: AtomicI64,

    closed: AtomicBool,
    /// Broadcast on close; session tasks select on it to drop their sockets
    pub(crate) shutdown: Notify,

    self_ref: OnceLock<Weak<Agent>>,
}

impl Agent {
    pub(crate) fn new(
        profile: Arc<ServerProfile>,
        crypt_key: u32,
        buffer_size: usize,
    ) -> Arc<Self> {
        let agent = Arc::new(Self {
            profile: parking_lot::RwLock::new(profile),
            crypt_key,
            buffer_size,
            sessions: SessionManager::new(),
            udp: UdpManager::new(buffer_size),
            tunnel: parking_lot::Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            reconnect_done: Notify::new(),
            listen_addr: parking_lot::Mutex::new(None),
            accept_task: parking_lot::Mutex::new(None),
            active_connections: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            self_ref: OnceLock::new(),
        });
        let _ = agent.self_ref.set(Arc::downgrade(&agent));
        agent
    }

    /// A strong handle to this agent (present for the whole lifetime,
    /// since the constructor is the only way to build one)
    fn strong(&self) -> Option<Arc<Agent>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    pub(crate) fn profile(&self) -> Arc<ServerProfile> {
        self.profile.read().clone()
    }

    pub(crate) fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    pub(crate) fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind the loopback listener, start accepting, and pre-connect the
    /// tunnel so the strategy is immediately usable.
    pub(crate) async fn start(&self) -> Result<(), StrategyError> {
        let local_port = self.profile().local_port;
        let addr = format!("127.0.0.1:{local_port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| StrategyError::bind(&addr, e.to_string()))?;
        let bound = listener.local_addr().map_err(StrategyError::IoError)?;
        *self.listen_addr.lock() = Some(bound);

        info!(listen_addr = %bound, strategy = "multiplexed", "Strategy listener started");

        if let Some(agent) = self.strong() {
            let task = tokio::spawn(async move {
                agent.accept_loop(listener).await;
            });
            *self.accept_task.lock() = Some(task);
        }

        self.connection().await.map(|_| ())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    warn!(error = %e, "Multiplexed listener accept failed");
                    continue;
                }
            };
            if self.is_closed() {
                return;
            }

            self.active_connections.fetch_add(1, Ordering::Relaxed);
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = handle_client(&agent, stream).await {
                    debug!(peer = %peer, error = %e, "Multiplexed session ended with error");
                }
                agent.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Get the live tunnel, dialing one if necessary.
    ///
    /// Concurrent callers during a dead tunnel coalesce onto a single dial;
    /// all of them observe the same tunnel object (or the dialer's error,
    /// in which case a waiter becomes the next dialer).
    pub(crate) async fn connection(&self) -> Result<Arc<Tunnel>, StrategyError> {
        loop {
            if self.is_closed() {
                return Err(StrategyError::NotReady("agent is closed".into()));
            }
            if let Some(tunnel) = self.tunnel.lock().clone() {
                return Ok(tunnel);
            }

            if self
                .reconnecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let result = self.dial().await;
                match result {
                    Ok((tunnel, read_half)) => {
                        *self.tunnel.lock() = Some(Arc::clone(&tunnel));
                        self.reconnecting.store(false, Ordering::Release);
                        self.reconnect_done.notify_waiters();

                        if let Some(agent) = self.strong() {
                            let loop_tunnel = Arc::clone(&tunnel);
                            tokio::spawn(async move {
                                agent.read_loop(loop_tunnel, read_half).await;
                            });
                        }
                        return Ok(tunnel);
                    }
                    Err(e) => {
                        self.reconnecting.store(false, Ordering::Release);
                        self.reconnect_done.notify_waiters();
                        return Err(e);
                    }
                }
            }

            // Another task is dialing; park until it finishes, then re-check.
            // The notified future is registered before the flag re-check so a
            // finish between the two cannot be missed.
            let notified = self.reconnect_done.notified();
            if !self.reconnecting.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }

    async fn dial(&self) -> Result<(Arc<Tunnel>, ReadHalf<WsByteStream>), StrategyError> {
        let profile = self.profile();
        status::set(format!("Connecting to {}...", profile.remarks));

        let config = transport_config(&profile);
        let stream = match transport::connect(&config).await {
            Ok(stream) => stream,
            Err(e) => {
                status::set(format!("Failed to connect to {}: {e}", profile.remarks));
                return Err(e.into());
            }
        };

        let cipher = Cipher::new(self.crypt_key, Algorithm::ChaCha20Poly1305)
            .map_err(|e| StrategyError::NotReady(format!("cipher setup failed: {e}")))?;

        status::set(format!("Connected to {}", profile.remarks));

        let (read_half, write_half) = tokio::io::split(stream);
        let tunnel = Arc::new(Tunnel {
            writer: tokio::sync::Mutex::new(write_half),
            cipher,
            closed: AtomicBool::new(false),
        });
        Ok((tunnel, read_half))
    }

    /// Read loop for one tunnel: dispatch packets by flag until the
    /// transport dies, then clear the tunnel and fail every live stream.
    async fn read_loop(self: Arc<Self>, tunnel: Arc<Tunnel>, mut reader: ReadHalf<WsByteStream>) {
        loop {
            let packet = match codec::read_packet(&mut reader, Some(&tunnel.cipher)).await {
                Ok(packet) => packet,
                Err(e) => {
                    if !self.is_closed() {
                        warn!(error = %e, "Tunnel read loop terminated");
                    }
                    break;
                }
            };

            match packet.flag {
                PacketFlag::NewStreamTcpSuccess => {
                    self.sessions.signal_ready(packet.stream_id);
                }
                PacketFlag::TcpData => {
                    self.sessions.push_downstream(packet.stream_id, packet.payload);
                }
                PacketFlag::UdpData => {
                    self.udp.handle_downstream(&packet.payload).await;
                }
                PacketFlag::CloseStream => {
                    self.sessions.remove_pipe(packet.stream_id);
                    self.sessions.remove_session(packet.stream_id);
                }
                PacketFlag::NewStreamTcp => {
                    debug!(stream_id = packet.stream_id, "Unexpected NewStreamTcp from remote");
                }
            }
        }

        self.clear_tunnel(&tunnel);
        // Tunnel death: every live stream observes EOF; the next new
        // stream transparently redials.
        self.sessions.abort_all();
    }

    /// Write one packet, dialing the tunnel first if needed
    pub(crate) async fn write_packet(&self, packet: &Packet) -> Result<(), StrategyError> {
        let tunnel = self.connection().await?;
        match tunnel.write(packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear_tunnel(&tunnel);
                Err(e)
            }
        }
    }

    /// Write one packet only if a tunnel is currently up (no redial).
    /// Used for best-effort control frames during teardown.
    pub(crate) async fn try_write_packet(&self, packet: &Packet) {
        let tunnel = self.tunnel.lock().clone();
        if let Some(tunnel) = tunnel {
            if tunnel.write(packet).await.is_err() {
                self.clear_tunnel(&tunnel);
            }
        }
    }

    /// Drop `tunnel` from the slot if it is still the current one
    fn clear_tunnel(&self, tunnel: &Arc<Tunnel>) {
        let mut slot = self.tunnel.lock();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, tunnel) {
                *slot = None;
            }
        }
        tunnel.closed.store(true, Ordering::Release);
    }

    /// Swap the profile; the current tunnel is dropped so the next stream
    /// dials the new endpoint.
    pub(crate) fn update_profile(&self, profile: Arc<ServerProfile>) {
        info!(remarks = %profile.remarks, "Updating multiplexed agent profile");
        *self.profile.write() = profile;
        let dropped = self.tunnel.lock().take();
        if let Some(tunnel) = dropped {
            tunnel.closed.store(true, Ordering::Release);
        }
    }

    /// Close the listener, force all live sessions down, and shut the
    /// tunnel transport.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(listen_addr = ?self.listen_addr(), "Closing multiplexed agent");

        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        // Wake every session task so the local sockets drop
        self.shutdown.notify_waiters();
        self.sessions.abort_all();
        self.udp.close().await;

        let tunnel = self.tunnel.lock().take();
        if let Some(tunnel) = tunnel {
            tunnel.shutdown().await;
        }
        // Unblock any connection() waiters
        self.reconnect_done.notify_waiters();
    }
}

/// Handle one accepted loopback connection: SOCKS5 handshake, then either
/// a TCP stream session or the UDP associate path.
async fn handle_client(agent: &Arc<Agent>, mut stream: TcpStream) -> Result<(), StrategyError> {
    let request = socks::handshake(&mut stream).await?;
    match request.command {
        CMD_CONNECT => session::run_tcp_session(agent, stream, &request).await,
        CMD_UDP_ASSOCIATE => super::udp::handle_udp_associate(agent, stream).await,
        other => {
            stream
                .write_all(&REPLY_COMMAND_UNSUPPORTED)
                .await
                .map_err(StrategyError::IoError)?;
            Err(StrategyError::RemoteRefused(format!(
                "unsupported SOCKS5 command {other}"
            )))
        }
    }
}
