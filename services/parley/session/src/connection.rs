//! Connection driver: one task per overlay connection.
//!
//! The driver owns the socket. It writes frames queued by sessions, reads and
//! dispatches frames from the node, keeps the link alive with PINGs and gives
//! up after an idle timeout. Everything else talks to it through
//! [`ConnectionShared`].

use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use parley_naming::Name;
use parley_routing::ConnectionId;
use parley_wire::{Frame, FrameDecoder, FrameType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::frames::{AckOutcome, RoutedMeta};
use crate::handshake::HELLO_MSG_ID;
use crate::keepalive::{build_ping, build_pong, now_corr_id, KeepaliveState};

/// Failures of a request over a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Connection is gone
    #[error("connection closed")]
    Closed,
    /// No ACK arrived in time
    #[error("no ack within {0:?}")]
    Timeout(Duration),
}

/// Something that happened to one session on the connection
#[derive(Debug)]
pub(crate) enum InboundEvent {
    /// A DATA frame addressed to the session
    Data(Frame),
    /// The session ended underneath its owner
    Closed {
        /// Why
        reason: String,
    },
}

/// Session request that arrived and waits for a listener
#[derive(Debug, Clone)]
pub(crate) struct PendingSession {
    pub(crate) conn: ConnectionId,
    pub(crate) session_id: u64,
    pub(crate) remote: Name,
    pub(crate) local: Name,
    pub(crate) encryption: bool,
}

/// Driver timing
#[derive(Debug, Clone, Copy)]
pub(crate) struct DriverConfig {
    pub(crate) ping_interval: Duration,
    pub(crate) idle_timeout: Duration,
}

/// Traffic counters for one connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Frames received
    pub frames_in: u64,
    /// Frames sent
    pub frames_out: u64,
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes sent
    pub bytes_out: u64,
    /// Most recent RTT measurement
    pub last_rtt: Option<Duration>,
}

/// State shared between the driver task and everything using the connection
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) peer: SocketAddr,
    pub(crate) max_frame: usize,
    outbound: mpsc::UnboundedSender<Bytes>,
    next_msg_id: AtomicU64,
    pending_acks: DashMap<u64, oneshot::Sender<AckOutcome>>,
    pending_establish: DashMap<u64, oneshot::Sender<()>>,
    /// Session requests queued for a listener and not yet withdrawn
    pending_requests: DashSet<u64>,
    sessions: DashMap<u64, mpsc::UnboundedSender<InboundEvent>>,
    subscribed: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ConnectionShared {
    /// Allocate the next request id
    pub(crate) fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_subscribed(&self) {
        self.subscribed.store(true, Ordering::SeqCst);
    }

    /// Queue a frame without waiting for an ACK
    pub(crate) fn send(&self, bytes: Bytes) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.outbound.send(bytes).map_err(|_| LinkError::Closed)
    }

    /// Queue a frame and wait for the node's ACK of `msg_id`
    pub(crate) async fn request(
        &self,
        msg_id: u64,
        bytes: Bytes,
        timeout: Duration,
    ) -> Result<AckOutcome, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.insert(msg_id, tx);

        // The driver marks the link closed before it clears pending acks
        if self.is_closed() || self.outbound.send(bytes).is_err() {
            self.pending_acks.remove(&msg_id);
            return Err(LinkError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.pending_acks.remove(&msg_id);
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    /// Open an inbox for `session_id`; `None` if the id is already in use
    pub(crate) fn register_session(
        &self,
        session_id: u64,
    ) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        if self.is_closed() {
            return None;
        }
        match self.sessions.entry(session_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                entry.insert(tx);
                Some(rx)
            }
        }
    }

    pub(crate) fn unregister_session(&self, session_id: u64) {
        self.sessions.remove(&session_id);
        self.pending_establish.remove(&session_id);
    }

    /// Arm a waiter for the remote's SESSION_ACCEPT
    pub(crate) fn expect_accept(&self, session_id: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_establish.insert(session_id, tx);
        rx
    }

    /// Claim a queued session request; `false` once its initiator withdrew it
    pub(crate) fn take_pending_request(&self, session_id: u64) -> bool {
        self.pending_requests.remove(&session_id).is_some()
    }

    /// Ask the driver to hang up
    pub(crate) fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn mark_closed(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending_acks.clear();
        self.pending_establish.clear();
        self.pending_requests.clear();
        self.sessions.retain(|_, inbox| {
            let _ = inbox.send(InboundEvent::Closed {
                reason: reason.to_string(),
            });
            false
        });
    }
}

/// Everything the driver task owns
pub(crate) struct ConnectionDriver {
    shared: Arc<ConnectionShared>,
    stream: TcpStream,
    decoder: FrameDecoder,
    buffer: BytesMut,
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    shutdown_rx: watch::Receiver<bool>,
    accept_tx: mpsc::UnboundedSender<PendingSession>,
    config: DriverConfig,
}

impl ConnectionDriver {
    /// Wire up a driver for an authorised stream
    ///
    /// `decoder` and `buffer` carry over from the handshake so bytes that
    /// arrived behind the HELLO ack are not lost.
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        decoder: FrameDecoder,
        buffer: BytesMut,
        max_frame: usize,
        accept_tx: mpsc::UnboundedSender<PendingSession>,
        config: DriverConfig,
    ) -> std::io::Result<(Self, Arc<ConnectionShared>)> {
        let peer = stream.peer_addr()?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(ConnectionShared {
            id,
            peer,
            max_frame,
            outbound,
            next_msg_id: AtomicU64::new(HELLO_MSG_ID + 1),
            pending_acks: DashMap::new(),
            pending_establish: DashMap::new(),
            pending_requests: DashSet::new(),
            sessions: DashMap::new(),
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        });

        let driver = Self {
            shared: shared.clone(),
            stream,
            decoder,
            buffer,
            outbound_rx,
            shutdown_rx,
            accept_tx,
            config,
        };
        Ok((driver, shared))
    }

    /// Run until the link fails, idles out or is closed locally
    pub(crate) async fn run(self) -> ConnectionStats {
        let Self {
            shared,
            stream,
            mut decoder,
            mut buffer,
            mut outbound_rx,
            mut shutdown_rx,
            accept_tx,
            config,
        } = self;

        let (mut reader, mut writer) = stream.into_split();
        let peer = shared.peer;
        let mut keepalive = KeepaliveState::default();
        let mut stats = ConnectionStats::default();

        info!("Connection {} to {} is up", shared.id, peer);

        let mut ping_interval =
            tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();

        // Frames that arrived together with the handshake
        let mut replies = Vec::new();
        while let Ok(Some(frame)) = decoder.decode(&mut buffer) {
            stats.frames_in += 1;
            replies.extend(handle_frame(&shared, &accept_tx, &mut keepalive, frame));
        }
        for reply in replies {
            let _ = shared.send(reply);
        }

        let reason = loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break "closed locally".to_string();
                    }
                }

                _ = ping_interval.tick() => {
                    let corr_id = now_corr_id();
                    match build_ping(corr_id, shared.max_frame) {
                        Ok(ping_bytes) => {
                            if let Err(e) = writer.write_all(&ping_bytes).await {
                                break format!("failed to send PING: {}", e);
                            }
                            keepalive.record_ping(corr_id);
                            stats.frames_out += 1;
                            stats.bytes_out += ping_bytes.len() as u64;
                            trace!("Sent PING to {} (corr_id: {})", peer, corr_id);
                        }
                        Err(e) => warn!("Failed to build PING: {}", e),
                    }
                }

                outbound = outbound_rx.recv() => {
                    let Some(frame_bytes) = outbound else {
                        break "all handles dropped".to_string();
                    };
                    if let Err(e) = writer.write_all(&frame_bytes).await {
                        break format!("write failed: {}", e);
                    }
                    stats.frames_out += 1;
                    stats.bytes_out += frame_bytes.len() as u64;
                }

                read = reader.read_buf(&mut buffer) => {
                    match read {
                        Ok(0) => break "closed by node".to_string(),
                        Ok(n) => {
                            last_activity = Instant::now();
                            stats.bytes_in += n as u64;
                        }
                        Err(e) => break format!("read failed: {}", e),
                    }

                    let mut failure = None;
                    loop {
                        match decoder.decode(&mut buffer) {
                            Ok(Some(frame)) => {
                                stats.frames_in += 1;
                                if let Some(reply) = handle_frame(&shared, &accept_tx, &mut keepalive, frame) {
                                    if let Err(e) = writer.write_all(&reply).await {
                                        failure = Some(format!("write failed: {}", e));
                                        break;
                                    }
                                    stats.frames_out += 1;
                                    stats.bytes_out += reply.len() as u64;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                failure = Some(format!("malformed frame: {}", e));
                                break;
                            }
                        }
                    }
                    if let Some(reason) = failure {
                        break reason;
                    }
                }

                _ = tokio::time::sleep_until(last_activity + config.idle_timeout) => {
                    warn!("Idle timeout reached for {}; closing connection", peer);
                    break "idle timeout".to_string();
                }
            }
        };

        stats.last_rtt = keepalive.last_rtt();
        shared.mark_closed(&reason);
        let _ = writer.shutdown().await;
        info!("Connection {} to {} ended ({}). Stats: {:?}", shared.id, peer, reason, stats);
        stats
    }
}

/// Dispatch one frame from the node, returning an immediate reply if any
fn handle_frame(
    shared: &ConnectionShared,
    accept_tx: &mpsc::UnboundedSender<PendingSession>,
    keepalive: &mut KeepaliveState,
    frame: Frame,
) -> Option<Bytes> {
    match frame.fast.typ {
        FrameType::Ack => {
            let outcome = AckOutcome::from_frame(&frame);
            match shared.pending_acks.remove(&frame.fast.corr_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(outcome);
                }
                None => debug!("ACK for unknown msg_id {}", frame.fast.corr_id),
            }
            None
        }

        FrameType::Ping => match build_pong(frame.fast.corr_id, shared.max_frame) {
            Ok(pong) => Some(pong),
            Err(e) => {
                warn!("Failed to build PONG: {}", e);
                None
            }
        },

        FrameType::Pong => {
            match keepalive.process_pong(frame.fast.corr_id) {
                Some(rtt) => debug!("RTT to {}: {:?}", shared.peer, rtt),
                None => debug!("Received PONG with unknown correlation ID: {}", frame.fast.corr_id),
            }
            None
        }

        FrameType::SessionRequest => {
            match RoutedMeta::from_frame(&frame) {
                Ok(meta) => {
                    debug!(
                        "Session request {} from {} (encryption: {})",
                        frame.fast.session_id, meta.src, meta.encryption
                    );
                    let pending = PendingSession {
                        conn: shared.id,
                        session_id: frame.fast.session_id,
                        remote: meta.src,
                        local: meta.dst,
                        encryption: meta.encryption,
                    };
                    shared.pending_requests.insert(pending.session_id);
                    let _ = accept_tx.send(pending);
                }
                Err(e) => warn!("Dropping malformed session request: {}", e),
            }
            None
        }

        FrameType::SessionAccept => {
            match shared.pending_establish.remove(&frame.fast.session_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(());
                }
                None => debug!("Unexpected accept for session {}", frame.fast.session_id),
            }
            None
        }

        FrameType::Data => {
            match shared.sessions.get(&frame.fast.session_id) {
                Some(inbox) => {
                    let _ = inbox.send(InboundEvent::Data(frame));
                }
                None => debug!("Dropping data for unknown session {}", frame.fast.session_id),
            }
            None
        }

        FrameType::SessionClose => {
            let session_id = frame.fast.session_id;
            shared.pending_establish.remove(&session_id);
            if shared.pending_requests.remove(&session_id).is_some() {
                debug!("Session request {} withdrawn before accept", session_id);
            }
            if let Some((_, inbox)) = shared.sessions.remove(&session_id) {
                debug!("Session {} closed by peer", session_id);
                let _ = inbox.send(InboundEvent::Closed {
                    reason: "closed by peer".to_string(),
                });
            }
            None
        }

        FrameType::Hello | FrameType::Subscribe => {
            warn!("Ignoring unexpected {:?} from {}", frame.fast.typ, shared.peer);
            None
        }
    }
}
