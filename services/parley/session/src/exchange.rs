//! Request/reply loops driven over sessions.
//!
//! The initiator sends a fixed number of requests and waits a bounded time
//! for each reply. The responder answers every request on a session until
//! the session goes quiet or fails. The accept loop gives every inbound
//! session its own task and, on shutdown, waits for each task to close its
//! session.
//!
//! What each loop does with an error is decided by one table,
//! [`LoopAction::for_error`].

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::error::SessionError;
use crate::session::{Message, MessageContext, PublishOptions, Session};

/// Payload type attached to every demo request and reply
pub const TEXT_PLAIN: &str = "text/plain";

/// Operations the loops need from a session
#[async_trait]
pub trait SessionIo: Send + Sync {
    /// Session id, for logs
    fn session_id(&self) -> u64;

    /// See [`Session::publish_and_wait`]
    async fn publish_and_wait(
        &self,
        payload: Bytes,
        context: Option<&MessageContext>,
        options: Option<PublishOptions>,
    ) -> Result<(), SessionError>;

    /// See [`Session::get_message`]
    async fn get_message(&mut self, timeout: Duration) -> Result<Message, SessionError>;

    /// See [`Session::delete_and_wait`]
    async fn delete_and_wait(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
impl SessionIo for Session {
    fn session_id(&self) -> u64 {
        self.id()
    }

    async fn publish_and_wait(
        &self,
        payload: Bytes,
        context: Option<&MessageContext>,
        options: Option<PublishOptions>,
    ) -> Result<(), SessionError> {
        Session::publish_and_wait(self, payload, context, options).await
    }

    async fn get_message(&mut self, timeout: Duration) -> Result<Message, SessionError> {
        Session::get_message(self, timeout).await
    }

    async fn delete_and_wait(&mut self) -> Result<(), SessionError> {
        Session::delete_and_wait(self).await
    }
}

/// Source of inbound sessions for the accept loop
#[async_trait]
pub trait SessionAcceptor: Send + Sync {
    /// Session type handed out
    type Session: SessionIo + 'static;

    /// Wait up to `timeout` for the next session
    async fn accept(&self, timeout: Duration) -> Result<Self::Session, SessionError>;
}

#[async_trait]
impl SessionAcceptor for App {
    type Session = Session;

    async fn accept(&self, timeout: Duration) -> Result<Session, SessionError> {
        self.listen_for_session(timeout).await
    }
}

/// Which loop is handling an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopRole {
    /// Sequential request loop
    Initiator,
    /// Per-session reply loop
    Responder,
    /// Outer listen loop
    Accept,
}

/// What a loop does after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Log and go on with the next iteration
    Continue,
    /// Log and stop the loop
    Terminate,
}

impl LoopAction {
    /// Error policy shared by every loop
    pub fn for_error(role: LoopRole, err: &SessionError) -> LoopAction {
        if err.is_setup_fatal() {
            return LoopAction::Terminate;
        }
        match (role, err) {
            (LoopRole::Accept, _) => LoopAction::Continue,
            (LoopRole::Responder, _) => LoopAction::Terminate,
            (LoopRole::Initiator, SessionError::SessionEstablish(_))
            | (LoopRole::Initiator, SessionError::Listen(_)) => LoopAction::Terminate,
            (LoopRole::Initiator, _) => LoopAction::Continue,
        }
    }
}

/// Produces request payloads for the initiator
pub trait PayloadSource: Send {
    /// Next payload
    fn next_payload(&mut self) -> Bytes;
}

/// Uniform random integers in `[min, max]` as decimal text
#[derive(Debug)]
pub struct RandomNumbers {
    rng: StdRng,
    min: i64,
    max: i64,
}

impl RandomNumbers {
    /// Entropy-seeded source; `None` when `min > max`
    pub fn new(min: i64, max: i64) -> Option<Self> {
        Self::with_rng(StdRng::from_entropy(), min, max)
    }

    /// Deterministic source for a given seed
    pub fn seeded(seed: u64, min: i64, max: i64) -> Option<Self> {
        Self::with_rng(StdRng::seed_from_u64(seed), min, max)
    }

    fn with_rng(rng: StdRng, min: i64, max: i64) -> Option<Self> {
        (min <= max).then_some(Self { rng, min, max })
    }
}

impl PayloadSource for RandomNumbers {
    fn next_payload(&mut self) -> Bytes {
        let n = self.rng.gen_range(self.min..=self.max);
        Bytes::from(n.to_string())
    }
}

/// Classify a decimal integer payload as `"even"` or `"odd"`
pub fn odd_even(payload: &[u8]) -> &'static str {
    match std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
    {
        Some(n) if n % 2 == 0 => "even",
        Some(_) => "odd",
        None => "not a number",
    }
}

/// Reply function used by the responder
pub type ReplyFn = Arc<dyn Fn(&[u8]) -> Bytes + Send + Sync>;

/// Reply function answering with [`odd_even`]
pub fn odd_even_reply() -> ReplyFn {
    Arc::new(|payload| Bytes::from_static(odd_even(payload).as_bytes()))
}

/// Initiator loop settings
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    /// Number of requests to send
    pub iterations: u32,
    /// Bound on each reply wait
    pub reply_timeout: Duration,
    /// Pause between iterations
    pub pacing: Duration,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            reply_timeout: Duration::from_secs(5),
            pacing: Duration::from_secs(1),
        }
    }
}

/// One request and what came back for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// 1-based iteration
    pub iteration: u32,
    /// Request payload as text
    pub sent: String,
    /// Reply text, or why there was none
    pub reply: Result<String, SessionError>,
}

/// Outcome of [`run_initiator`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitiatorReport {
    /// Every iteration in order
    pub exchanges: Vec<Exchange>,
    /// Publish attempts
    pub published: u32,
    /// Publishes that failed
    pub publish_failures: u32,
    /// Replies received
    pub replies: u32,
    /// Reply waits that failed
    pub reply_failures: u32,
}

/// Send `config.iterations` requests, waiting for a reply to each
pub async fn run_initiator<S, P>(
    session: &mut S,
    source: &mut P,
    config: &InitiatorConfig,
) -> InitiatorReport
where
    S: SessionIo + ?Sized,
    P: PayloadSource + ?Sized,
{
    let mut report = InitiatorReport::default();

    for i in 1..=config.iterations {
        let payload = source.next_payload();
        let sent = String::from_utf8_lossy(&payload).into_owned();

        report.published += 1;
        let published = session
            .publish_and_wait(
                payload,
                None,
                Some(PublishOptions::with_payload_type(TEXT_PLAIN)),
            )
            .await;

        let reply = match published {
            Ok(()) => {
                info!("  >> Sent    : {} ({}/{})", sent, i, config.iterations);
                match session.get_message(config.reply_timeout).await {
                    Ok(message) => {
                        report.replies += 1;
                        let text = message.text().into_owned();
                        info!("  << Received: {}", text);
                        Ok(text)
                    }
                    Err(e) => {
                        report.reply_failures += 1;
                        warn!("  !! No reply for {} ({}/{}): {}", sent, i, config.iterations, e);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                report.publish_failures += 1;
                warn!("  !! Publish of {} failed ({}/{}): {}", sent, i, config.iterations, e);
                Err(e)
            }
        };

        let stop = match &reply {
            Err(e) => LoopAction::for_error(LoopRole::Initiator, e) == LoopAction::Terminate,
            Ok(_) => false,
        };
        report.exchanges.push(Exchange {
            iteration: i,
            sent,
            reply,
        });
        if stop {
            break;
        }

        if i < config.iterations && !config.pacing.is_zero() {
            tokio::time::sleep(config.pacing).await;
        }
    }

    report
}

/// Outcome of [`serve_session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeReport {
    /// Session served
    pub session_id: u64,
    /// Requests answered
    pub handled: u32,
    /// Error that ended the loop; `None` when stopped locally
    pub ended_by: Option<SessionError>,
}

/// Resolves once `stop` turns true; never if its sender goes away first
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let sender_gone = stop.wait_for(|stopping| *stopping).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// Answer requests on one session until a receive or reply fails or `stop`
/// turns true
pub async fn serve_session<S>(
    session: &mut S,
    liveness: Duration,
    reply: &ReplyFn,
    stop: &mut watch::Receiver<bool>,
) -> ServeReport
where
    S: SessionIo + ?Sized,
{
    let session_id = session.session_id();
    let mut handled = 0;

    let ended_by = loop {
        let received = tokio::select! {
            biased;
            _ = stop_requested(stop) => break None,
            received = session.get_message(liveness) => received,
        };
        let message = match received {
            Ok(message) => message,
            Err(e) => break Some(e),
        };

        let text = message.text();
        let answer = reply(&message.payload);
        info!(
            "  << [{}] {} -> {}",
            message.context.source,
            text,
            String::from_utf8_lossy(&answer)
        );

        if let Err(e) = session
            .publish_and_wait(
                answer,
                Some(&message.context),
                Some(PublishOptions::with_payload_type(TEXT_PLAIN)),
            )
            .await
        {
            break Some(e);
        }
        handled += 1;
    };

    match &ended_by {
        None => info!("Session {} stopping for shutdown", session_id),
        Some(SessionError::SessionClosed) => info!("Session {} closed by peer", session_id),
        Some(SessionError::Timeout(_)) => info!("Session {} idle, closing", session_id),
        Some(e) => {
            debug_assert_eq!(
                LoopAction::for_error(LoopRole::Responder, e),
                LoopAction::Terminate
            );
            warn!("Session {} ended: {}", session_id, e)
        }
    }

    ServeReport {
        session_id,
        handled,
        ended_by,
    }
}

/// Serve a session, then always close it
pub async fn handle_session<S>(
    mut session: S,
    liveness: Duration,
    reply: ReplyFn,
    mut stop: watch::Receiver<bool>,
) -> ServeReport
where
    S: SessionIo,
{
    let report = serve_session(&mut session, liveness, &reply, &mut stop).await;
    if let Err(e) = session.delete_and_wait().await {
        debug!("Closing session {} failed: {}", report.session_id, e);
    }
    report
}

/// Accept loop settings
#[derive(Debug, Clone)]
pub struct AcceptConfig {
    /// Bound on each listen attempt
    pub listen_timeout: Duration,
    /// Pause after a failed listen other than a timeout
    pub listen_retry_delay: Duration,
    /// Bound on each receive inside a session
    pub liveness: Duration,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            listen_timeout: Duration::from_secs(60),
            listen_retry_delay: Duration::from_secs(1),
            liveness: Duration::from_secs(60),
        }
    }
}

/// Outcome of [`run_accept_loop`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptReport {
    /// Sessions handed to handlers
    pub accepted: u32,
    /// Listen attempts that failed
    pub failed_listens: u32,
    /// Handlers that ran to completion
    pub completed: Vec<ServeReport>,
    /// Setup error that stopped the loop, if any
    pub fatal: Option<SessionError>,
}

/// Accept sessions until `shutdown` resolves, one handler task per session
///
/// Handlers still running at shutdown are told to stop and awaited, so each
/// closes its session before this returns.
pub async fn run_accept_loop<A, F>(
    acceptor: A,
    config: AcceptConfig,
    reply: ReplyFn,
    shutdown: F,
) -> AcceptReport
where
    A: SessionAcceptor,
    F: Future<Output = ()> + Send,
{
    let mut report = AcceptReport::default();
    let mut handlers: JoinSet<ServeReport> = JoinSet::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping accept loop");
                break;
            }
            accepted = acceptor.accept(config.listen_timeout) => accepted,
        };

        while let Some(done) = handlers.try_join_next() {
            if let Ok(serve) = done {
                report.completed.push(serve);
            }
        }

        match accepted {
            Ok(session) => {
                report.accepted += 1;
                info!("Session {} accepted", session.session_id());
                handlers.spawn(handle_session(
                    session,
                    config.liveness,
                    reply.clone(),
                    stop_rx.clone(),
                ));
            }
            Err(e) => {
                report.failed_listens += 1;
                match LoopAction::for_error(LoopRole::Accept, &e) {
                    LoopAction::Terminate => {
                        warn!("Accept loop stopping: {}", e);
                        report.fatal = Some(e);
                        break;
                    }
                    LoopAction::Continue => {
                        if let SessionError::Timeout(_) = e {
                            debug!("No session within {:?}", config.listen_timeout);
                            continue;
                        }
                        warn!("Listen failed: {}", e);
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(config.listen_retry_delay) => {}
                        }
                    }
                }
            }
        }
    }

    if !handlers.is_empty() {
        info!("Closing {} open session(s)", handlers.len());
    }
    stop_tx.send_replace(true);
    while let Some(done) = handlers.join_next().await {
        if let Ok(serve) = done {
            report.completed.push(serve);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_naming::Name;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted session: replies are computed from what was published
    struct MockSession {
        id: u64,
        peer: Name,
        publishes: AtomicU32,
        fail_publish_at: Vec<u32>,
        drop_reply_at: Vec<u32>,
        outbox: Mutex<VecDeque<Bytes>>,
        inbox: VecDeque<Result<Bytes, SessionError>>,
        reply: Option<ReplyFn>,
        sent: Mutex<Vec<(Bytes, Option<MessageContext>)>>,
        deletes: Arc<AtomicU32>,
        /// Wait out the timeout instead of failing at once when idle
        blocks_when_idle: bool,
    }

    impl MockSession {
        fn new(id: u64) -> Self {
            Self {
                id,
                peer: Name::parse("org/peer/v1").unwrap(),
                publishes: AtomicU32::new(0),
                fail_publish_at: Vec::new(),
                drop_reply_at: Vec::new(),
                outbox: Mutex::new(VecDeque::new()),
                inbox: VecDeque::new(),
                reply: None,
                sent: Mutex::new(Vec::new()),
                deletes: Arc::new(AtomicU32::new(0)),
                blocks_when_idle: false,
            }
        }

        fn answering(mut self, reply: ReplyFn) -> Self {
            self.reply = Some(reply);
            self
        }

        fn with_inbox(mut self, inbox: Vec<Result<&'static str, SessionError>>) -> Self {
            self.inbox = inbox
                .into_iter()
                .map(|item| item.map(|s| Bytes::from_static(s.as_bytes())))
                .collect();
            self
        }

        fn message(&self, payload: Bytes, n: u64) -> Message {
            Message {
                payload,
                context: MessageContext {
                    source: self.peer.clone(),
                    session_id: self.id,
                    message_id: n,
                },
                payload_type: Some(TEXT_PLAIN.to_string()),
                metadata: Default::default(),
            }
        }
    }

    #[async_trait]
    impl SessionIo for MockSession {
        fn session_id(&self) -> u64 {
            self.id
        }

        async fn publish_and_wait(
            &self,
            payload: Bytes,
            context: Option<&MessageContext>,
            _options: Option<PublishOptions>,
        ) -> Result<(), SessionError> {
            let n = self.publishes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_publish_at.contains(&n) {
                return Err(SessionError::Send("injected".into()));
            }
            self.sent.lock().unwrap().push((payload.clone(), context.cloned()));
            if let Some(reply) = &self.reply {
                if !self.drop_reply_at.contains(&n) {
                    self.outbox.lock().unwrap().push_back(reply(&payload));
                }
            }
            Ok(())
        }

        async fn get_message(&mut self, timeout: Duration) -> Result<Message, SessionError> {
            let next = self.outbox.lock().unwrap().pop_front();
            if let Some(payload) = next {
                return Ok(self.message(payload, 0));
            }
            match self.inbox.pop_front() {
                Some(Ok(payload)) => Ok(self.message(payload, 1)),
                Some(Err(e)) => Err(e),
                None => {
                    if self.blocks_when_idle {
                        tokio::time::sleep(timeout).await;
                    }
                    Err(SessionError::Timeout(timeout))
                }
            }
        }

        async fn delete_and_wait(&mut self) -> Result<(), SessionError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Stop signal whose sender is gone, so it never fires
    fn never_stopped() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn fast_initiator(iterations: u32) -> InitiatorConfig {
        InitiatorConfig {
            iterations,
            reply_timeout: Duration::from_millis(10),
            pacing: Duration::ZERO,
        }
    }

    #[test]
    fn test_odd_even() {
        assert_eq!(odd_even(b"1"), "odd");
        assert_eq!(odd_even(b"42"), "even");
        assert_eq!(odd_even(b"0"), "even");
        assert_eq!(odd_even(b"-3"), "odd");
        assert_eq!(odd_even(b" 7 "), "odd");
        assert_eq!(odd_even(b"abc"), "not a number");
        assert_eq!(odd_even(b""), "not a number");
        assert_eq!(odd_even(&[0xff, 0xfe]), "not a number");
    }

    #[test]
    fn test_random_numbers_in_range() {
        assert!(RandomNumbers::new(5, 1).is_none());

        let mut source = RandomNumbers::seeded(7, 1, 100).unwrap();
        for _ in 0..200 {
            let n: i64 = String::from_utf8(source.next_payload().to_vec())
                .unwrap()
                .parse()
                .unwrap();
            assert!((1..=100).contains(&n));
        }

        let mut fixed = RandomNumbers::new(1, 1).unwrap();
        assert_eq!(fixed.next_payload(), Bytes::from_static(b"1"));
    }

    #[test]
    fn test_error_decision_table() {
        use LoopAction::*;
        use LoopRole::*;

        let timeout = SessionError::Timeout(Duration::from_secs(5));
        let send = SessionError::Send("x".into());
        let receive = SessionError::Receive("x".into());
        let closed = SessionError::SessionClosed;
        let establish = SessionError::SessionEstablish("x".into());
        let listen = SessionError::Listen("x".into());
        let setup = SessionError::Connection("x".into());

        for e in [&timeout, &send, &receive, &closed] {
            assert_eq!(LoopAction::for_error(Initiator, e), Continue);
            assert_eq!(LoopAction::for_error(Responder, e), Terminate);
            assert_eq!(LoopAction::for_error(Accept, e), Continue);
        }
        for e in [&establish, &listen] {
            assert_eq!(LoopAction::for_error(Initiator, e), Terminate);
            assert_eq!(LoopAction::for_error(Responder, e), Terminate);
            assert_eq!(LoopAction::for_error(Accept, e), Continue);
        }
        for role in [Initiator, Responder, Accept] {
            assert_eq!(LoopAction::for_error(role, &setup), Terminate);
        }
    }

    #[tokio::test]
    async fn test_initiator_three_odd_replies() {
        let mut session = MockSession::new(1).answering(odd_even_reply());
        let mut source = RandomNumbers::new(1, 1).unwrap();

        let report = run_initiator(&mut session, &mut source, &fast_initiator(3)).await;

        assert_eq!(report.published, 3);
        assert_eq!(report.replies, 3);
        let replies: Vec<_> = report
            .exchanges
            .iter()
            .map(|e| e.reply.clone().unwrap())
            .collect();
        assert_eq!(replies, vec!["odd", "odd", "odd"]);
        assert!(report.exchanges.iter().all(|e| e.sent == "1"));
    }

    #[tokio::test]
    async fn test_initiator_publishes_exactly_n_despite_failures() {
        let mut session = MockSession::new(1).answering(odd_even_reply());
        session.fail_publish_at = vec![2, 5];
        session.drop_reply_at = vec![3, 4];
        let mut source = RandomNumbers::seeded(1, 1, 100).unwrap();

        let report = run_initiator(&mut session, &mut source, &fast_initiator(7)).await;

        assert_eq!(session.publishes.load(Ordering::SeqCst), 7);
        assert_eq!(report.published, 7);
        assert_eq!(report.exchanges.len(), 7);
        assert_eq!(report.publish_failures, 2);
        assert_eq!(report.reply_failures, 2);
        assert_eq!(report.replies, 3);
        assert!(matches!(
            report.exchanges[2].reply,
            Err(SessionError::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_paces_between_iterations() {
        let mut session = MockSession::new(1).answering(odd_even_reply());
        let mut source = RandomNumbers::new(2, 2).unwrap();
        let config = InitiatorConfig {
            iterations: 3,
            reply_timeout: Duration::from_secs(5),
            pacing: Duration::from_secs(1),
        };

        let started = tokio::time::Instant::now();
        run_initiator(&mut session, &mut source, &config).await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_serve_replies_through_context_until_closed() {
        let mut session = MockSession::new(9).with_inbox(vec![
            Ok("4"),
            Ok("7"),
            Ok("seven"),
            Err(SessionError::SessionClosed),
        ]);

        let report = serve_session(
            &mut session,
            Duration::from_secs(60),
            &odd_even_reply(),
            &mut never_stopped(),
        )
        .await;

        assert_eq!(report.handled, 3);
        assert_eq!(report.ended_by, Some(SessionError::SessionClosed));
        assert_eq!(session.deletes.load(Ordering::SeqCst), 0);
        let sent = session.sent.lock().unwrap().clone();
        let texts: Vec<_> = sent.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(
            texts,
            vec![
                Bytes::from_static(b"even"),
                Bytes::from_static(b"odd"),
                Bytes::from_static(b"not a number")
            ]
        );
        assert!(sent
            .iter()
            .all(|(_, ctx)| ctx.as_ref().map(|c| c.source.to_string()) == Some("org/peer/v1".into())));
    }

    #[tokio::test]
    async fn test_serve_stops_on_publish_failure_and_handler_deletes() {
        let mut session = MockSession::new(3).with_inbox(vec![Ok("1"), Ok("2")]);
        session.fail_publish_at = vec![1];

        let deletes = session.deletes.clone();

        let report = handle_session(
            session,
            Duration::from_secs(1),
            odd_even_reply(),
            never_stopped(),
        )
        .await;
        assert_eq!(report.handled, 0);
        assert!(matches!(report.ended_by, Some(SessionError::Send(_))));
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_idle_session_and_closes_it() {
        let mut session = MockSession::new(4).with_inbox(vec![Ok("8")]);
        session.blocks_when_idle = true;
        let deletes = session.deletes.clone();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handler = tokio::spawn(handle_session(
            session,
            Duration::from_secs(60),
            odd_even_reply(),
            stop_rx,
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send_replace(true);

        let report = handler.await.unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(report.ended_by, None);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replies_are_deterministic_across_sessions() {
        let payloads = vec![Ok("10"), Ok("11"), Ok("x"), Ok("-2")];
        let mut a = MockSession::new(1).with_inbox(payloads.clone());
        let mut b = MockSession::new(2).with_inbox(payloads);

        let reply = odd_even_reply();
        serve_session(&mut a, Duration::from_secs(1), &reply, &mut never_stopped()).await;
        serve_session(&mut b, Duration::from_secs(1), &reply, &mut never_stopped()).await;

        let replies = |s: &MockSession| -> Vec<Bytes> {
            s.sent.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        };
        assert_eq!(replies(&a), replies(&b));
        assert_eq!(replies(&a).len(), 4);
    }

    /// Acceptor handing out scripted sessions, then idling
    struct MockAcceptor {
        queue: Mutex<VecDeque<Result<MockSession, SessionError>>>,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SessionAcceptor for MockAcceptor {
        type Session = MockSession;

        async fn accept(&self, timeout: Duration) -> Result<MockSession, SessionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(item) => item,
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(SessionError::Timeout(timeout))
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_loop_isolates_sessions() {
        let mut failing = MockSession::new(1).with_inbox(vec![Ok("1"), Ok("2")]);
        failing.fail_publish_at = vec![1];
        let healthy = MockSession::new(2).with_inbox(vec![
            Ok("1"),
            Ok("2"),
            Ok("3"),
            Err(SessionError::SessionClosed),
        ]);

        let acceptor = MockAcceptor {
            queue: Mutex::new(VecDeque::from(vec![
                Ok(failing),
                Err(SessionError::Listen("transient".into())),
                Ok(healthy),
            ])),
            attempts: AtomicU32::new(0),
        };
        let config = AcceptConfig {
            listen_timeout: Duration::from_secs(1),
            listen_retry_delay: Duration::from_millis(100),
            liveness: Duration::from_secs(5),
        };

        let report = run_accept_loop(
            acceptor,
            config,
            odd_even_reply(),
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await;

        assert_eq!(report.accepted, 2);
        assert!(report.failed_listens >= 1);
        assert!(report.fatal.is_none());

        let mut completed = report.completed.clone();
        completed.sort_by_key(|r| r.session_id);
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].handled, 0);
        assert!(matches!(completed[0].ended_by, Some(SessionError::Send(_))));
        assert_eq!(completed[1].handled, 3);
        assert_eq!(completed[1].ended_by, Some(SessionError::SessionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_sessions_still_open() {
        let mut idle = MockSession::new(5).with_inbox(vec![Ok("2")]);
        idle.blocks_when_idle = true;
        let deletes = idle.deletes.clone();

        let acceptor = MockAcceptor {
            queue: Mutex::new(VecDeque::from(vec![Ok(idle)])),
            attempts: AtomicU32::new(0),
        };
        let config = AcceptConfig {
            listen_timeout: Duration::from_secs(1),
            listen_retry_delay: Duration::from_millis(100),
            liveness: Duration::from_secs(60),
        };

        let report = run_accept_loop(
            acceptor,
            config,
            odd_even_reply(),
            tokio::time::sleep(Duration::from_secs(3)),
        )
        .await;

        assert_eq!(report.accepted, 1);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].handled, 1);
        assert_eq!(report.completed[0].ended_by, None);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_loop_stops_on_setup_error() {
        let acceptor = MockAcceptor {
            queue: Mutex::new(VecDeque::from(vec![Err(SessionError::Connection(
                "gone".into(),
            ))])),
            attempts: AtomicU32::new(0),
        };

        let report = run_accept_loop(
            acceptor,
            AcceptConfig::default(),
            odd_even_reply(),
            std::future::pending(),
        )
        .await;

        assert_eq!(report.accepted, 0);
        assert!(matches!(report.fatal, Some(SessionError::Connection(_))));
    }
}
