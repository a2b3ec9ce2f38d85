//! SOCKS5 UDP ASSOCIATE over the multiplexed tunnel
//!
//! UDP datagrams are carried inside the framed tunnel on the reserved
//! aggregate stream id `0xFFFF`. One association (a local packet socket
//! plus NAT tables) is shared by all UDP clients of an agent; it is
//! created on the first ASSOCIATE and rebuilt if its socket dies.
//!
//! The datagrams keep their SOCKS5 UDP header end to end: upstream, the
//! header names the target; downstream, the remote writes the source into
//! the same fields and the NAT reverse map finds the waiting client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::agent::Agent;
use crate::codec::{Packet, PacketFlag, UDP_STREAM_ID};
use crate::error::StrategyError;
use crate::strategy::socks::{udp_associate_reply, REPLY_GENERAL_FAILURE};

/// Idle timeout for NAT entries (and the recv poll interval)
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// One shared UDP association
pub(crate) struct UdpAssociation {
    socket: Arc<UdpSocket>,
    /// client addr -> last activity
    forward: DashMap<String, Instant>,
    /// target "host:port" -> client addr
    reverse: DashMap<String, String>,
    running: AtomicBool,
    stop: Notify,
}

impl UdpAssociation {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drop NAT entries idle past the timeout
    fn cleanup_nat(&self) {
        self.cleanup_nat_at(Instant::now());
    }

    fn cleanup_nat_at(&self, now: Instant) {
        let mut expired = Vec::new();
        self.forward.retain(|client, last_seen| {
            let live = now.duration_since(*last_seen) <= UDP_IDLE_TIMEOUT;
            if !live {
                expired.push(client.clone());
            }
            live
        });
        if !expired.is_empty() {
            self.reverse
                .retain(|_, client| !expired.contains(client));
            debug!(count = expired.len(), "Expired idle UDP NAT entries");
        }
    }
}

/// Manager of the agent's singleton association
pub(crate) struct UdpManager {
    association: tokio::sync::Mutex<Option<Arc<UdpAssociation>>>,
    buffer_size: usize,
}

impl UdpManager {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            association: tokio::sync::Mutex::new(None),
            buffer_size,
        }
    }

    /// Get the live association, creating (or rebuilding) it on demand
    pub(crate) async fn get_or_create(
        &self,
        agent: &Arc<Agent>,
    ) -> Result<Arc<UdpAssociation>, StrategyError> {
        let mut slot = self.association.lock().await;
        if let Some(assoc) = slot.as_ref() {
            if assoc.is_running() {
                return Ok(Arc::clone(assoc));
            }
        }

        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(|e| StrategyError::bind("127.0.0.1:0/udp", e.to_string()))?;
        let assoc = Arc::new(UdpAssociation {
            socket: Arc::new(socket),
            forward: DashMap::new(),
            reverse: DashMap::new(),
            running: AtomicBool::new(true),
            stop: Notify::new(),
        });
        *slot = Some(Arc::clone(&assoc));

        let agent = Arc::clone(agent);
        let task_assoc = Arc::clone(&assoc);
        let buffer_size = self.buffer_size;
        tokio::spawn(async move {
            upstream_loop(agent, task_assoc, buffer_size).await;
        });

        Ok(assoc)
    }

    /// Route a downstream datagram back to the client the NAT knows about
    pub(crate) async fn handle_downstream(&self, payload: &[u8]) {
        let assoc = {
            let slot = self.association.lock().await;
            slot.clone()
        };
        let Some(assoc) = assoc else {
            return;
        };
        if !assoc.is_running() {
            return;
        }

        let Some((host, port)) = parse_socks5_udp_addr(payload) else {
            trace!("Downstream UDP packet with unparsable header dropped");
            return;
        };
        let key = format!("{host}:{port}");

        let Some(client) = assoc.reverse.get(&key).map(|c| c.value().clone()) else {
            trace!(source = %key, "Downstream UDP packet without NAT entry dropped");
            return;
        };
        let Ok(client_addr) = client.parse::<SocketAddr>() else {
            return;
        };

        if let Err(e) = assoc.socket.send_to(payload, client_addr).await {
            debug!(error = %e, client = %client, "Failed to deliver downstream UDP packet");
        }
    }

    pub(crate) async fn close(&self) {
        let slot = self.association.lock().await.take();
        if let Some(assoc) = slot {
            assoc.running.store(false, Ordering::Release);
            assoc.stop.notify_waiters();
        }
    }
}

/// Read client datagrams, register NAT entries, and push them into the
/// tunnel on the reserved stream id.
async fn upstream_loop(agent: Arc<Agent>, assoc: Arc<UdpAssociation>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        if agent.is_closed() || !assoc.is_running() {
            break;
        }

        let recv = tokio::select! {
            recv = timeout(UDP_IDLE_TIMEOUT, assoc.socket.recv_from(&mut buf)) => recv,
            () = assoc.stop.notified() => break,
        };
        let received = match recv {
            Err(_) => {
                assoc.cleanup_nat();
                continue;
            }
            Ok(Err(e)) => {
                debug!(error = %e, "UDP association socket failed");
                break;
            }
            Ok(Ok(received)) => received,
        };
        let (n, client_addr) = received;

        let Some((host, port)) = parse_socks5_udp_addr(&buf[..n]) else {
            trace!(client = %client_addr, "Unparsable client UDP datagram dropped");
            continue;
        };

        assoc
            .forward
            .insert(client_addr.to_string(), Instant::now());
        assoc
            .reverse
            .insert(format!("{host}:{port}"), client_addr.to_string());

        let packet = Packet::new(UDP_STREAM_ID, PacketFlag::UdpData, buf[..n].to_vec());
        if let Err(e) = agent.write_packet(&packet).await {
            warn!(error = %e, "Failed to tunnel UDP datagram");
        }
    }

    assoc.running.store(false, Ordering::Release);
    debug!("UDP association upstream loop stopped");
}

/// Parse the address fields of a SOCKS5 UDP header:
/// `RSV(2) FRAG(1) ATYP(1) ADDR PORT DATA...`
#[must_use]
pub(crate) fn parse_socks5_udp_addr(data: &[u8]) -> Option<(String, u16)> {
    if data.len() < 10 {
        return None;
    }
    match data[3] {
        0x01 => {
            let host = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]).to_string();
            let port = u16::from_be_bytes([data[8], data[9]]);
            Some((host, port))
        }
        0x03 => {
            let len = data[4] as usize;
            if data.len() < 5 + len + 2 {
                return None;
            }
            let host = std::str::from_utf8(&data[5..5 + len]).ok()?.to_string();
            let port = u16::from_be_bytes([data[5 + len], data[5 + len + 1]]);
            Some((host, port))
        }
        0x04 => {
            if data.len() < 4 + 16 + 2 {
                return None;
            }
            let octets: [u8; 16] = data[4..20].try_into().ok()?;
            let host = std::net::Ipv6Addr::from(octets).to_string();
            let port = u16::from_be_bytes([data[20], data[21]]);
            Some((host, port))
        }
        _ => None,
    }
}

/// Serve one UDP ASSOCIATE control connection: reply with the relay
/// address, then hold the TCP connection until the client drops it.
pub(crate) async fn handle_udp_associate(
    agent: &Arc<Agent>,
    mut stream: TcpStream,
) -> Result<(), StrategyError> {
    let assoc = match agent.udp.get_or_create(agent).await {
        Ok(assoc) => assoc,
        Err(e) => {
            let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
            return Err(e);
        }
    };

    let Some(relay_addr) = assoc.local_addr() else {
        let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
        return Err(StrategyError::NotReady("udp relay has no local address".into()));
    };

    stream
        .write_all(&udp_associate_reply(relay_addr))
        .await
        .map_err(StrategyError::IoError)?;

    // The association lives as long as any client; this connection just
    // has to stay parked until its client goes away.
    let mut sink = [0u8; 256];
    loop {
        tokio::select! {
            read = stream.read(&mut sink) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            () = agent.shutdown.notified() => break,
        }
    }
    Ok(())
}
