//! Overlay node: listener, per-connection loop and name routing.
//!
//! Every accepted connection runs its own task. After the HELLO exchange the
//! task reads frames, answers PING, records SUBSCRIBE and forwards routed
//! frames to the connection that subscribed their destination. Anything
//! written to a connection goes through its outbound channel so forwards
//! from other tasks and local acks never interleave mid-frame.

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parley_naming::Name;
use parley_routing::{
    ConnectionId, Router, RoutingContext, RoutingDecision, SubscriptionTable,
};
use parley_session::crypto::SharedSecret;
use parley_session::frames::{build_ack, RoutedMeta, META_NAME};
use parley_session::handshake::accept_hello;
use parley_session::keepalive::build_pong;
use parley_session::transport::listen_tcp;
use parley_wire::{
    get_meta_str, parse_meta, Frame, FrameDecoder, FrameType, StatusCode, DEFAULT_MAX_FRAME_SIZE,
};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::OverlayError;

/// Default node address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:46357";

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Overlay node settings
#[derive(Clone)]
pub struct NodeConfig {
    /// Address to listen on
    pub listen: SocketAddr,
    /// Secret clients must prove knowledge of
    pub secret: String,
    /// Bound on the HELLO exchange
    pub handshake_timeout: Duration,
    /// Connection is dropped after this long without inbound traffic
    pub idle_timeout: Duration,
    /// Largest frame accepted or forwarded
    pub max_frame_size: usize,
}

impl NodeConfig {
    /// Settings for `listen` with default timeouts
    pub fn new(listen: SocketAddr, secret: impl Into<String>) -> Self {
        Self {
            listen,
            secret: secret.into(),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("listen", &self.listen)
            .field("secret", &"<redacted>")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

struct NodeShared {
    secret: SharedSecret,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    max_frame: usize,
    subscriptions: SubscriptionTable,
    links: DashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>,
    next_conn_id: AtomicU64,
}

/// Releases a connection's link and subscriptions however its task ends
struct LinkGuard {
    shared: Arc<NodeShared>,
    id: ConnectionId,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.shared.links.remove(&self.id);
        let released = self.shared.subscriptions.unsubscribe_connection(self.id);
        for name in released {
            info!("Released {} held by {}", name, self.id);
        }
    }
}

/// A bound overlay node
pub struct OverlayNode {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<NodeShared>,
}

impl OverlayNode {
    /// Validate `config` and bind the listener
    pub async fn bind(config: NodeConfig) -> Result<Self, OverlayError> {
        let secret =
            SharedSecret::new(config.secret.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;
        if config.max_frame_size == 0 {
            return Err(OverlayError::Config("max frame size must be positive".into()));
        }

        let listener = listen_tcp(config.listen)
            .await
            .map_err(|source| OverlayError::Bind {
                addr: config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(NodeShared {
                secret,
                handshake_timeout: config.handshake_timeout,
                idle_timeout: config.idle_timeout,
                max_frame: config.max_frame_size,
                subscriptions: SubscriptionTable::new(),
                links: DashMap::new(),
                next_conn_id: AtomicU64::new(1),
            }),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), OverlayError>
    where
        F: Future<Output = ()>,
    {
        info!("Overlay node listening on {}", self.local_addr);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = ConnectionId(self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed));
                        info!("Accepted TCP connection from {} ({})", peer, id);
                        let shared = self.shared.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(shared, id, stream).await {
                                warn!("{} from {} ended: {:#}", id, peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        info!(
            "Overlay node on {} shutting down, dropping {} connections",
            self.local_addr,
            connections.len()
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(
    shared: Arc<NodeShared>,
    id: ConnectionId,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let mut decoder = FrameDecoder::with_max_frame_size(shared.max_frame);
    let mut buffer = BytesMut::with_capacity(64 * 1024);

    let name = tokio::time::timeout(
        shared.handshake_timeout,
        accept_hello(
            &mut stream,
            &mut decoder,
            &mut buffer,
            &shared.secret,
            shared.max_frame,
        ),
    )
    .await
    .context("HELLO timed out")??;
    info!("{} authorised as {}", id, name);

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    shared.links.insert(id, tx.clone());
    let _guard = LinkGuard {
        shared: shared.clone(),
        id,
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut last_activity = Instant::now();

    let reason = loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(frame_bytes) => writer.write_all(&frame_bytes).await.context("write failed")?,
                None => break "link dropped",
            },
            read = reader.read_buf(&mut buffer) => {
                if read.context("read failed")? == 0 {
                    break "peer closed";
                }
                last_activity = Instant::now();
                while let Some(frame) = decoder.decode(&mut buffer)? {
                    handle_frame(&shared, id, &name, &tx, frame).await;
                }
            }
            _ = tokio::time::sleep_until(last_activity + shared.idle_timeout) => {
                break "idle timeout";
            }
        }
    };

    info!("{} ({}) disconnected: {}", id, name, reason);
    Ok(())
}

async fn handle_frame(
    shared: &NodeShared,
    id: ConnectionId,
    authorised: &Name,
    reply: &mpsc::UnboundedSender<Bytes>,
    frame: Frame,
) {
    let fast = frame.fast;
    match fast.typ {
        FrameType::Ping => match build_pong(fast.corr_id, shared.max_frame) {
            Ok(pong) => {
                let _ = reply.send(pong);
            }
            Err(e) => warn!("Failed to build PONG: {}", e),
        },
        FrameType::Pong | FrameType::Ack => {
            trace!("{:?} from {}", fast.typ, id);
        }
        FrameType::Subscribe => match subscribe(shared, id, authorised, &frame) {
            Ok(name) => {
                info!("{} subscribed {}", id, name);
                ack(shared, reply, &frame, StatusCode::Ok, None);
            }
            Err(reason) => {
                warn!("{} subscribe rejected: {}", id, reason);
                ack(shared, reply, &frame, StatusCode::Fatal, Some(&reason));
            }
        },
        typ if typ.is_routed() => route(shared, id, authorised, reply, frame).await,
        other => {
            warn!("Unexpected {:?} from {}", other, id);
            ack(shared, reply, &frame, StatusCode::Unsupported, None);
        }
    }
}

/// A connection may only claim the name its HELLO proved
fn subscribe(
    shared: &NodeShared,
    id: ConnectionId,
    authorised: &Name,
    frame: &Frame,
) -> Result<Name, String> {
    let meta = parse_meta(&frame.meta_raw).map_err(|e| e.to_string())?;
    let name = get_meta_str(&meta, META_NAME).ok_or_else(|| "missing name".to_string())?;
    let name = Name::parse(&name).map_err(|e| e.to_string())?;
    if name != *authorised {
        return Err(format!("not authorised for {}", name));
    }
    shared
        .subscriptions
        .subscribe(name.clone(), id)
        .map_err(|e| e.to_string())?;
    Ok(name)
}

async fn route(
    shared: &NodeShared,
    id: ConnectionId,
    authorised: &Name,
    reply: &mpsc::UnboundedSender<Bytes>,
    frame: Frame,
) {
    let meta = match RoutedMeta::from_frame(&frame) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("{:?} from {} without valid names: {}", frame.fast.typ, id, e);
            ack(shared, reply, &frame, StatusCode::Fatal, Some("invalid destination"));
            return;
        }
    };
    if meta.src != *authorised {
        warn!(
            "{:?} from {} claims source {} but is authorised as {}",
            frame.fast.typ, id, meta.src, authorised
        );
        let reason = format!("not authorised for {}", meta.src);
        ack(shared, reply, &frame, StatusCode::Fatal, Some(&reason));
        return;
    }

    let ctx = RoutingContext::new(id, meta.dst.clone(), frame.fast.ttl);
    match shared.subscriptions.decide(&ctx).await {
        RoutingDecision::Forward(target) => {
            let mut forwarded = frame.clone();
            let delivered = forwarded.fast.decrement_ttl().is_ok()
                && match forwarded.encode(shared.max_frame) {
                    Ok(frame_bytes) => shared
                        .links
                        .get(&target)
                        .map(|link| link.send(frame_bytes).is_ok())
                        .unwrap_or(false),
                    Err(e) => {
                        warn!("Failed to re-encode frame for {}: {}", target, e);
                        false
                    }
                };

            if delivered {
                debug!(
                    "{:?} {} -> {} via {}",
                    frame.fast.typ, meta.src, meta.dst, target
                );
                ack(shared, reply, &frame, StatusCode::Ok, None);
            } else {
                ack(shared, reply, &frame, StatusCode::Fatal, Some("no route"));
            }
        }
        RoutingDecision::Drop(reason) => {
            debug!(
                "Dropped {:?} {} -> {}: {}",
                frame.fast.typ, meta.src, meta.dst, reason
            );
            ack(
                shared,
                reply,
                &frame,
                StatusCode::Fatal,
                Some(&reason.to_string()),
            );
        }
    }
}

/// Acknowledge `frame` to its sender unless it asked for no ACK
fn ack(
    shared: &NodeShared,
    reply: &mpsc::UnboundedSender<Bytes>,
    frame: &Frame,
    code: StatusCode,
    reason: Option<&str>,
) {
    if frame.fast.msg_id == 0 {
        return;
    }
    match build_ack(
        frame.fast.msg_id,
        frame.fast.session_id,
        code,
        reason,
        shared.max_frame,
    ) {
        Ok(frame_bytes) => {
            let _ = reply.send(frame_bytes);
        }
        Err(e) => warn!("Failed to build ACK: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_session::{App, SessionConfig, SessionError};

    const SECRET: &str = "overlay-test-secret-with-32-chars!";

    async fn spawn_node() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let node = OverlayNode::bind(NodeConfig::new("127.0.0.1:0".parse().unwrap(), SECRET))
            .await
            .unwrap();
        let addr = node.local_addr();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(node.run(async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx)
    }

    fn name(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_bind_rejects_short_secret() {
        let result = OverlayNode::bind(NodeConfig::new("127.0.0.1:0".parse().unwrap(), "short")).await;
        assert!(matches!(result, Err(OverlayError::Config(_))));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorised() {
        let (addr, _stop) = spawn_node().await;
        let app = App::new(name("org/mallory/v1"), "a-different-secret-of-32-characters").unwrap();

        match app.connect(&addr.to_string()).await {
            Err(SessionError::Connection(msg)) => assert!(msg.contains("unauthorised"), "{}", msg),
            other => panic!("expected connection error, got {:?}", other.map(|c| c.to_string())),
        }
    }

    #[tokio::test]
    async fn test_subscribe_conflict_and_release() {
        let (addr, _stop) = spawn_node().await;
        let alice = name("org/alice/v1");

        let first = App::new(alice.clone(), SECRET).unwrap();
        let conn = first.connect(&addr.to_string()).await.unwrap();
        first.subscribe(&alice, conn).await.unwrap();
        first.subscribe(&alice, conn).await.unwrap();

        let second = App::new(alice.clone(), SECRET).unwrap();
        let second_conn = second.connect(&addr.to_string()).await.unwrap();
        match second.subscribe(&alice, second_conn).await {
            Err(SessionError::Subscription(msg)) => assert!(msg.contains("rejected"), "{}", msg),
            other => panic!("expected subscription error, got {:?}", other),
        }

        first.disconnect(conn);
        let mut released = false;
        for _ in 0..50 {
            if second.subscribe(&alice, second_conn).await.is_ok() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released);
    }

    #[tokio::test]
    async fn test_subscribe_other_identity_is_refused() {
        let (addr, _stop) = spawn_node().await;
        let alice = name("org/alice/v1");
        let bob = name("org/bob/v1");

        let impostor = App::new(bob.clone(), SECRET).unwrap();
        let impostor_conn = impostor.connect(&addr.to_string()).await.unwrap();
        match impostor.subscribe(&alice, impostor_conn).await {
            Err(SessionError::Subscription(msg)) => {
                assert!(msg.contains("not authorised for org/alice/v1"), "{}", msg)
            }
            other => panic!("expected subscription error, got {:?}", other),
        }
        impostor.subscribe(&bob, impostor_conn).await.unwrap();

        let owner = App::new(alice.clone(), SECRET).unwrap();
        let owner_conn = owner.connect(&addr.to_string()).await.unwrap();
        owner.subscribe(&alice, owner_conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_routed_frame_with_foreign_source_is_refused() {
        let (addr, _stop) = spawn_node().await;
        let alice = name("org/alice/v1");
        let bob = name("org/bob/v1");
        let mallory = name("org/mallory/v1");

        let owner = App::new(alice.clone(), SECRET).unwrap();
        let owner_conn = owner.connect(&addr.to_string()).await.unwrap();
        owner.subscribe(&alice, owner_conn).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let secret = SharedSecret::new(SECRET).unwrap();
        parley_session::handshake::client_handshake(
            &mut stream,
            &mut decoder,
            &mut buffer,
            &mallory,
            &secret,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .unwrap();

        let request = parley_session::frames::build_session_request(
            7,
            9,
            &bob,
            &alice,
            false,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .unwrap();
        stream.write_all(&request).await.unwrap();

        let ack = loop {
            if let Some(frame) = decoder.decode(&mut buffer).unwrap() {
                break frame;
            }
            assert!(stream.read_buf(&mut buffer).await.unwrap() > 0);
        };
        assert_eq!(ack.fast.typ, FrameType::Ack);
        assert_eq!(ack.fast.corr_id, 9);
        let outcome = parley_session::frames::AckOutcome::from_frame(&ack);
        assert!(!outcome.is_ok());
        assert!(outcome.describe().contains("not authorised for org/bob/v1"));
    }

    #[tokio::test]
    async fn test_unknown_destination_has_no_route() {
        let (addr, _stop) = spawn_node().await;
        let alice = name("org/alice/v1");
        let nobody = name("org/nobody/v1");

        let app = App::new(alice.clone(), SECRET).unwrap();
        let conn = app.connect(&addr.to_string()).await.unwrap();
        app.subscribe(&alice, conn).await.unwrap();
        app.set_route(&nobody, conn).unwrap();

        match app
            .create_session_and_wait(SessionConfig::default(), &nobody)
            .await
        {
            Err(SessionError::SessionEstablish(msg)) => assert!(msg.contains("no route"), "{}", msg),
            other => panic!("expected establish error, got {:?}", other.map(|s| s.id())),
        }
    }

    #[tokio::test]
    async fn test_session_to_self_is_a_routing_loop() {
        let (addr, _stop) = spawn_node().await;
        let alice = name("org/alice/v1");

        let app = App::new(alice.clone(), SECRET).unwrap();
        let conn = app.connect(&addr.to_string()).await.unwrap();
        app.subscribe(&alice, conn).await.unwrap();
        app.set_route(&alice, conn).unwrap();

        match app
            .create_session_and_wait(SessionConfig::default(), &alice)
            .await
        {
            Err(SessionError::SessionEstablish(msg)) => {
                assert!(msg.contains("routing loop"), "{}", msg)
            }
            other => panic!("expected establish error, got {:?}", other.map(|s| s.id())),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_node() {
        let node = OverlayNode::bind(NodeConfig::new("127.0.0.1:0".parse().unwrap(), SECRET))
            .await
            .unwrap();
        let addr = node.local_addr();
        let run = tokio::spawn(node.run(tokio::time::sleep(Duration::from_millis(50))));
        run.await.unwrap().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
