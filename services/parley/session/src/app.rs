//! Process-wide transport context.
//!
//! An [`App`] holds the local identity, the shared secret, every overlay
//! connection, the route table and the subscriptions, plus the queue of
//! inbound session requests. It is cheap to clone; clones share state.

use bytes::BytesMut;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use parley_naming::Name;
use parley_routing::{ConnectionId, RouteTable, SubscriptionTable};
use parley_wire::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionDriver, ConnectionShared, DriverConfig, PendingSession};
use crate::crypto::{GroupKey, SharedSecret};
use crate::error::SessionError;
use crate::frames::{self, build_subscribe};
use crate::handshake::client_handshake;
use crate::session::{Session, SessionConfig, SessionRole};
use crate::transport::{connect_tcp, Endpoint};

/// Connection-level settings
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Bound on TCP connect
    pub connect_timeout: Duration,
    /// Bound on the HELLO exchange
    pub handshake_timeout: Duration,
    /// Interval between PING frames
    pub ping_interval: Duration,
    /// Connection is dropped after this long without inbound traffic
    pub idle_timeout: Duration,
    /// Bound on SUBSCRIBE and SESSION_ACCEPT acknowledgements
    pub request_timeout: Duration,
    /// Largest frame sent or accepted
    pub max_frame_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct AppInner {
    local: Name,
    secret: SharedSecret,
    config: AppConfig,
    connections: DashMap<ConnectionId, Arc<ConnectionShared>>,
    routes: RouteTable,
    subscriptions: SubscriptionTable,
    next_conn_id: AtomicU64,
    accept_tx: mpsc::UnboundedSender<PendingSession>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<PendingSession>>,
    /// Live connections that carry at least one subscription
    listenable: watch::Sender<usize>,
}

impl AppInner {
    fn live_connection(&self, conn: ConnectionId) -> Option<Arc<ConnectionShared>> {
        self.connections
            .get(&conn)
            .map(|entry| entry.value().clone())
            .filter(|link| !link.is_closed())
    }

    fn refresh_listenable(&self) {
        let count = self
            .connections
            .iter()
            .filter(|entry| entry.is_subscribed() && !entry.is_closed())
            .count();
        self.listenable.send_replace(count);
    }

    fn connection_lost(&self, conn: ConnectionId) {
        self.connections.remove(&conn);
        let released = self.subscriptions.unsubscribe_connection(conn);
        if !released.is_empty() {
            debug!("Released {} subscription(s) held by {}", released.len(), conn);
        }
        self.refresh_listenable();
    }
}

impl Drop for AppInner {
    fn drop(&mut self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}

/// Handle to the process-wide transport state
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    /// Create a context for `local` authorising with `secret`
    pub fn new(local: Name, secret: impl Into<String>) -> Result<Self, SessionError> {
        Self::with_config(local, secret, AppConfig::default())
    }

    /// Create a context with explicit connection settings
    pub fn with_config(
        local: Name,
        secret: impl Into<String>,
        config: AppConfig,
    ) -> Result<Self, SessionError> {
        let secret = SharedSecret::new(secret)?;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (listenable, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(AppInner {
                local,
                secret,
                config,
                connections: DashMap::new(),
                routes: RouteTable::new(),
                subscriptions: SubscriptionTable::new(),
                next_conn_id: AtomicU64::new(1),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                listenable,
            }),
        })
    }

    /// Local identity
    pub fn local_name(&self) -> &Name {
        &self.inner.local
    }

    /// Connection settings
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Connect and authorise against the overlay node at `server`
    pub async fn connect(&self, server: &str) -> Result<ConnectionId, SessionError> {
        let endpoint = Endpoint::parse(server)?;
        let config = &self.inner.config;

        let mut stream = tokio::time::timeout(config.connect_timeout, connect_tcp(&endpoint))
            .await
            .map_err(|_| {
                SessionError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    endpoint, config.connect_timeout
                ))
            })?
            .map_err(|e| SessionError::Connection(format!("connect to {}: {}", endpoint, e)))?;

        let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        let mut buffer = BytesMut::with_capacity(64 * 1024);
        tokio::time::timeout(
            config.handshake_timeout,
            client_handshake(
                &mut stream,
                &mut decoder,
                &mut buffer,
                &self.inner.local,
                &self.inner.secret,
                config.max_frame_size,
            ),
        )
        .await
        .map_err(|_| {
            SessionError::Connection(format!(
                "handshake with {} timed out after {:?}",
                endpoint, config.handshake_timeout
            ))
        })?
        .map_err(|e| SessionError::Connection(format!("handshake with {}: {:#}", endpoint, e)))?;

        let id = ConnectionId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let (driver, shared) = ConnectionDriver::new(
            id,
            stream,
            decoder,
            buffer,
            config.max_frame_size,
            self.inner.accept_tx.clone(),
            DriverConfig {
                ping_interval: config.ping_interval,
                idle_timeout: config.idle_timeout,
            },
        )
        .map_err(|e| SessionError::Connection(e.to_string()))?;
        self.inner.connections.insert(id, shared);

        let weak: Weak<AppInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            driver.run().await;
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(id);
            }
        });

        info!("Connected to {} as {} ({})", endpoint, self.inner.local, id);
        Ok(id)
    }

    /// Hang up a connection; its sessions observe `SessionClosed`
    pub fn disconnect(&self, conn: ConnectionId) {
        if let Some(link) = self.inner.connections.get(&conn) {
            link.close();
        }
    }

    /// Register `identity` for inbound sessions on `conn`
    pub async fn subscribe(&self, identity: &Name, conn: ConnectionId) -> Result<(), SessionError> {
        let link = self.inner.live_connection(conn).ok_or_else(|| {
            SessionError::Subscription(format!("{} is not a live connection", conn))
        })?;

        if let Some(holder) = self.inner.subscriptions.holder_of(identity) {
            if holder == conn {
                return Ok(());
            }
        }
        self.inner
            .subscriptions
            .subscribe(identity.clone(), conn)
            .map_err(|e| SessionError::Subscription(e.to_string()))?;

        let msg_id = link.next_msg_id();
        let outcome = match build_subscribe(identity, msg_id, link.max_frame) {
            Ok(frame_bytes) => link
                .request(msg_id, frame_bytes, self.inner.config.request_timeout)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(outcome) if outcome.is_ok() => {
                link.mark_subscribed();
                self.inner.refresh_listenable();
                info!("Subscribed {} on {}", identity, conn);
                Ok(())
            }
            Ok(outcome) => {
                self.inner.subscriptions.unsubscribe(identity, conn);
                Err(SessionError::Subscription(format!(
                    "{} rejected: {}",
                    identity,
                    outcome.describe()
                )))
            }
            Err(reason) => {
                self.inner.subscriptions.unsubscribe(identity, conn);
                Err(SessionError::Subscription(format!(
                    "{} not acknowledged: {}",
                    identity, reason
                )))
            }
        }
    }

    /// Bind `remote` to `conn` for session creation
    pub fn set_route(&self, remote: &Name, conn: ConnectionId) -> Result<(), SessionError> {
        if self.inner.live_connection(conn).is_none() {
            return Err(SessionError::Routing(format!(
                "{} is not a live connection",
                conn
            )));
        }
        if let Some(previous) = self.inner.routes.set_route(remote.clone(), conn) {
            debug!("Route to {} moved from {} to {}", remote, previous, conn);
        }
        Ok(())
    }

    /// Connection currently bound to `remote`
    pub fn route_for(&self, remote: &Name) -> Option<ConnectionId> {
        self.inner.routes.route_for(remote)
    }

    /// Open a session to `remote` and wait until it is accepted
    pub async fn create_session_and_wait(
        &self,
        config: SessionConfig,
        remote: &Name,
    ) -> Result<Session, SessionError> {
        let conn = self.inner.routes.route_for(remote).ok_or_else(|| {
            SessionError::SessionEstablish(format!("no route to {}", remote))
        })?;
        let link = self.inner.live_connection(conn).ok_or_else(|| {
            SessionError::SessionEstablish(format!("{} for {} is closed", conn, remote))
        })?;

        let (session_id, inbox) = loop {
            let candidate: u64 = rand::thread_rng().gen_range(1..=u64::MAX);
            if let Some(inbox) = link.register_session(candidate) {
                break (candidate, inbox);
            }
            if link.is_closed() {
                return Err(SessionError::SessionEstablish(format!(
                    "{} closed while opening a session",
                    conn
                )));
            }
        };

        let deadline = Instant::now().checked_add(config.handshake_timeout);
        let accepted = link.expect_accept(session_id);
        let result = async {
            let msg_id = link.next_msg_id();
            let frame_bytes = frames::build_session_request(
                session_id,
                msg_id,
                &self.inner.local,
                remote,
                config.encryption,
                link.max_frame,
            )
            .map_err(|e| SessionError::SessionEstablish(e.to_string()))?;

            let outcome = link
                .request(msg_id, frame_bytes, config.handshake_timeout)
                .await
                .map_err(|e| SessionError::SessionEstablish(e.to_string()))?;
            if !outcome.is_ok() {
                return Err(SessionError::SessionEstablish(format!(
                    "{} unreachable: {}",
                    remote,
                    outcome.describe()
                )));
            }

            let accepted = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, accepted).await,
                None => Ok(accepted.await),
            };
            match accepted {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SessionError::SessionEstablish(format!(
                    "{} went away before accepting",
                    remote
                ))),
                Err(_) => Err(SessionError::SessionEstablish(format!(
                    "{} did not accept within {:?}",
                    remote, config.handshake_timeout
                ))),
            }
        }
        .await;

        if let Err(e) = result {
            link.unregister_session(session_id);
            // The request may already sit in the remote's accept queue
            match frames::build_session_close(
                session_id,
                0,
                &self.inner.local,
                remote,
                link.max_frame,
            ) {
                Ok(close) => {
                    if link.send(close).is_ok() {
                        debug!("Withdrew session request {} to {}", session_id, remote);
                    }
                }
                Err(build_err) => {
                    warn!("Failed to build SESSION_CLOSE for {}: {}", session_id, build_err)
                }
            }
            return Err(e);
        }

        let key = config
            .encryption
            .then(|| GroupKey::derive(&self.inner.secret, session_id));
        info!(
            "Session {} with {} established (encryption: {})",
            session_id, remote, config.encryption
        );
        Ok(Session::new(
            session_id,
            SessionRole::Initiator,
            self.inner.local.clone(),
            remote.clone(),
            link,
            inbox,
            key,
            config,
        ))
    }

    /// Wait up to `timeout` for the next inbound session
    pub async fn listen_for_session(&self, timeout: Duration) -> Result<Session, SessionError> {
        // A deadline past the clock's range waits forever
        self.listen(Instant::now().checked_add(timeout), timeout).await
    }

    /// Inbound sessions as an endless stream
    ///
    /// Each item is one accept attempt; an error does not end the stream.
    pub fn incoming_sessions(&self) -> impl Stream<Item = Result<Session, SessionError>> {
        stream::unfold(self.clone(), |app| async move {
            let next = app.listen(None, Duration::ZERO).await;
            Some((next, app))
        })
    }

    /// Close `session` and wait for the node to acknowledge it
    pub async fn delete_session_and_wait(&self, session: &mut Session) -> Result<(), SessionError> {
        session.delete_and_wait().await
    }

    async fn listen(
        &self,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<Session, SessionError> {
        let mut listenable = self.inner.listenable.subscribe();
        let mut accept_rx = self.inner.accept_rx.lock().await;

        loop {
            if *listenable.borrow_and_update() == 0 {
                return Err(SessionError::Listen(
                    "no live subscribed connection".to_string(),
                ));
            }

            let pending = match accept_rx.try_recv() {
                Ok(pending) => pending,
                Err(_) => {
                    let expired = deadline.map_or(false, |d| d <= Instant::now());
                    if expired {
                        return Err(SessionError::Timeout(timeout));
                    }
                    let sleep = async {
                        match deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => futures::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        pending = accept_rx.recv() => match pending {
                            Some(pending) => pending,
                            None => return Err(SessionError::Listen("accept queue closed".to_string())),
                        },
                        _ = listenable.changed() => continue,
                        _ = sleep => return Err(SessionError::Timeout(timeout)),
                    }
                }
            };

            match self.accept(pending).await {
                Ok(session) => return Ok(session),
                Err(e) => warn!("Dropping inbound session request: {}", e),
            }
        }
    }

    async fn accept(&self, pending: PendingSession) -> Result<Session, SessionError> {
        let link = self.inner.live_connection(pending.conn).ok_or_else(|| {
            SessionError::Listen(format!("{} closed before accept", pending.conn))
        })?;
        let inbox = link.register_session(pending.session_id).ok_or_else(|| {
            SessionError::Listen(format!(
                "session id {} already in use on {}",
                pending.session_id, pending.conn
            ))
        })?;
        // Claimed after registering so a close racing the accept reaches the inbox
        if !link.take_pending_request(pending.session_id) {
            link.unregister_session(pending.session_id);
            return Err(SessionError::Listen(format!(
                "session request {} from {} was withdrawn",
                pending.session_id, pending.remote
            )));
        }

        let msg_id = link.next_msg_id();
        let sent = match frames::build_session_accept(
            pending.session_id,
            msg_id,
            &pending.local,
            &pending.remote,
            link.max_frame,
        ) {
            Ok(frame_bytes) => link
                .request(msg_id, frame_bytes, self.inner.config.request_timeout)
                .await
                .map_err(|e| e.to_string())
                .and_then(|outcome| {
                    if outcome.is_ok() {
                        Ok(())
                    } else {
                        Err(outcome.describe())
                    }
                }),
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = sent {
            link.unregister_session(pending.session_id);
            return Err(SessionError::Listen(format!(
                "accept for {} failed: {}",
                pending.remote, reason
            )));
        }

        let key = pending
            .encryption
            .then(|| GroupKey::derive(&self.inner.secret, pending.session_id));
        info!(
            "Accepted session {} from {} (encryption: {})",
            pending.session_id, pending.remote, pending.encryption
        );
        Ok(Session::new(
            pending.session_id,
            SessionRole::Responder,
            pending.local,
            pending.remote,
            link,
            inbox,
            key,
            SessionConfig {
                encryption: pending.encryption,
                ..SessionConfig::default()
            },
        ))
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("local", &self.inner.local)
            .field("connections", &self.inner.connections.len())
            .field("routes", &self.inner.routes.len())
            .finish()
    }
}
