//! Stream sessions and their bookkeeping
//!
//! A session carries one local TCP connection over one tunnel stream id.
//! The manager keys everything by id: a session entry (holding the
//! one-shot ready signal) and, once the remote confirms, a bounded
//! downstream pipe. Ownership of the session lives with the task driving
//! its duplex copy; the maps only hold the channels needed to reach it.
//!
//! The downstream pipe is a bounded queue (512 buffers). When it
//! overflows, the packet is dropped with a warning rather than stalling
//! the shared tunnel read loop; only the affected stream is disturbed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::agent::Agent;
use crate::codec::{
    build_stream_metadata, Packet, PacketFlag, CMD_CONNECT, MAX_TCP_STREAM_ID,
};
use crate::error::StrategyError;
use crate::strategy::socks::{ClientRequest, REPLY_GENERAL_FAILURE, REPLY_SUCCESS};

/// Downstream queue depth per stream
pub(crate) const STREAM_QUEUE_CAPACITY: usize = 512;

/// How long a new stream waits for the remote's confirmation
pub(crate) const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

struct SessionEntry {
    ready: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

/// Bookkeeping for all live streams on one agent
pub(crate) struct SessionManager {
    sessions: DashMap<u16, Arc<SessionEntry>>,
    pipes: DashMap<u16, mpsc::Sender<Vec<u8>>>,
    next_id: AtomicU32,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            pipes: DashMap::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Allocate a stream id in `[1, 65530]`, skipping ids still live.
    ///
    /// The counter wraps; `0xFFFF` (and the rest of the reserved tail) is
    /// never produced.
    pub(crate) fn allocate(&self) -> Result<(u16, oneshot::Receiver<()>), StrategyError> {
        for _ in 0..u32::from(MAX_TCP_STREAM_ID) {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = (raw % u32::from(MAX_TCP_STREAM_ID)) as u16 + 1;

            match self.sessions.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = oneshot::channel();
                    vacant.insert(Arc::new(SessionEntry {
                        ready: parking_lot::Mutex::new(Some(tx)),
                    }));
                    return Ok((id, rx));
                }
            }
        }
        Err(StrategyError::StreamIdsExhausted)
    }

    /// Deliver the remote's stream-open confirmation
    pub(crate) fn signal_ready(&self, stream_id: u16) {
        if let Some(entry) = self.sessions.get(&stream_id) {
            if let Some(tx) = entry.ready.lock().take() {
                let _ = tx.send(());
            }
        }
    }

    /// Install the downstream pipe for a confirmed stream
    pub(crate) fn install_pipe(&self, stream_id: u16) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        self.pipes.insert(stream_id, tx);
        rx
    }

    /// Push downstream bytes into a stream's pipe (drop on overflow)
    pub(crate) fn push_downstream(&self, stream_id: u16, data: Vec<u8>) {
        if let Some(pipe) = self.pipes.get(&stream_id) {
            if pipe.try_send(data).is_err() {
                warn!(stream_id, "Downstream queue full, dropping packet");
            }
        } else {
            trace!(stream_id, "Downstream data for unknown stream dropped");
        }
    }

    /// Remove a stream's pipe; its reader observes EOF
    pub(crate) fn remove_pipe(&self, stream_id: u16) {
        self.pipes.remove(&stream_id);
    }

    /// Remove a session entry (frees the id; a pending opener is failed)
    pub(crate) fn remove_session(&self, stream_id: u16) {
        self.sessions.remove(&stream_id);
    }

    /// Fail every live stream at once (tunnel death or agent close)
    pub(crate) fn abort_all(&self) {
        self.pipes.clear();
        self.sessions.clear();
    }

    #[cfg(test)]
    pub(crate) fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Drive one CONNECT session end to end.
///
/// The success reply to the local client goes out right after the
/// `NewStreamTcp` packet is written, before the remote confirms; the data
/// pipes only open once the confirmation arrives (or the open times out
/// and the session dies).
pub(crate) async fn run_tcp_session(
    agent: &Arc<Agent>,
    mut stream: TcpStream,
    request: &ClientRequest,
) -> Result<(), StrategyError> {
    let (stream_id, ready_rx) = agent.sessions.allocate()?;

    let metadata = build_stream_metadata(CMD_CONNECT, &request.host, request.port);
    let open = Packet::new(stream_id, PacketFlag::NewStreamTcp, metadata);
    if let Err(e) = agent.write_packet(&open).await {
        agent.sessions.remove_session(stream_id);
        let _ = stream.write_all(&REPLY_GENERAL_FAILURE).await;
        return Err(e);
    }

    // Optimistic reply: the client may start sending immediately
    stream
        .write_all(&REPLY_SUCCESS)
        .await
        .map_err(StrategyError::IoError)?;

    match timeout(STREAM_OPEN_TIMEOUT, ready_rx).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            // Entry was removed: the remote closed the stream before
            // confirming it
            agent.sessions.remove_session(stream_id);
            return Err(StrategyError::RemoteRefused(format!(
                "stream {stream_id} aborted before confirmation"
            )));
        }
        Err(_) => {
            agent.sessions.remove_session(stream_id);
            agent
                .try_write_packet(&Packet::control(stream_id, PacketFlag::CloseStream))
                .await;
            return Err(StrategyError::StreamOpenTimeout {
                timeout_secs: STREAM_OPEN_TIMEOUT.as_secs(),
            });
        }
    }

    trace!(stream_id, target = %request.target(), "Stream established");

    let mut pipe_rx = agent.sessions.install_pipe(stream_id);
    let (mut read_half, mut write_half) = stream.into_split();

    let upstream = async {
        let mut buf = vec![0u8; agent.buffer_size];
        loop {
            let n = read_half.read(&mut buf).await.map_err(StrategyError::IoError)?;
            if n == 0 {
                return Ok::<(), StrategyError>(());
            }
            let packet = Packet::new(stream_id, PacketFlag::TcpData, buf[..n].to_vec());
            agent.write_packet(&packet).await?;
        }
    };

    let downstream = async {
        while let Some(data) = pipe_rx.recv().await {
            write_half
                .write_all(&data)
                .await
                .map_err(StrategyError::IoError)?;
        }
        // Pipe removed: remote close or tunnel death
        Ok::<(), StrategyError>(())
    };

    let result = tokio::select! {
        res = upstream => res,
        res = downstream => res,
        () = agent.shutdown.notified() => Ok(()),
    };

    agent.sessions.remove_pipe(stream_id);
    agent.sessions.remove_session(stream_id);
    if !agent.is_closed() {
        agent
            .try_write_packet(&Packet::control(stream_id, PacketFlag::CloseStream))
            .await;
    }

    debug!(stream_id, "Stream session finished");
    result
}
