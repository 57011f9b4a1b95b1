//! Point-to-point sessions over an overlay connection.
//!
//! A [`Session`] is one conversation between the local name and one remote
//! name. It owns its inbox, so exactly one task reads from it at a time, and
//! its encryption mode is fixed when the session is established.

use bytes::Bytes;
use parley_naming::Name;
use parley_routing::ConnectionId;
use parley_wire::{
    get_meta_bytes, get_meta_str, get_user_meta, parse_meta, Flags, Frame, FrameType,
};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::connection::{ConnectionShared, InboundEvent};
use crate::crypto::GroupKey;
use crate::error::SessionError;
use crate::frames::{self, META_NONCE, META_PAYLOAD_TYPE, META_SRC};

/// Per-session settings
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Seal payloads with the session's group key
    pub encryption: bool,
    /// How long the initiator waits for SESSION_ACCEPT
    pub handshake_timeout: Duration,
    /// How long a publish waits for the node to acknowledge forwarding
    pub ack_timeout: Duration,
    /// How long a delete waits for the node to acknowledge SESSION_CLOSE
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            encryption: true,
            handshake_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Which side opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Sent the SESSION_REQUEST
    Initiator,
    /// Accepted it
    Responder,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, nothing sent yet
    Created,
    /// Waiting for the remote to accept
    Establishing,
    /// Messages may flow
    Active,
    /// Teardown in progress
    Closing,
    /// Finished
    Closed,
}

/// Rejected state change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal session transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current state
    pub from: SessionState,
    /// Requested state
    pub to: SessionState,
}

impl SessionState {
    /// Move to `next` if the lifecycle allows it
    pub fn transition(self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;
        let allowed = matches!(
            (self, next),
            (Created, Establishing)
                | (Created, Active)
                | (Establishing, Active)
                | (Establishing, Closed)
                | (Active, Closing)
                | (Active, Closed)
                | (Closing, Closed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Establishing => "establishing",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Where a message came from; pass it back to address a reply
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageContext {
    /// Sender
    pub source: Name,
    /// Session the message arrived on
    pub session_id: u64,
    /// Sender's request id
    pub message_id: u64,
}

/// Optional attributes carried with a published payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Application payload type, e.g. `text/plain`
    pub payload_type: Option<String>,
    /// Free-form string metadata
    pub metadata: BTreeMap<String, String>,
}

impl PublishOptions {
    /// Options carrying only a payload type
    pub fn with_payload_type(payload_type: impl Into<String>) -> Self {
        Self {
            payload_type: Some(payload_type.into()),
            metadata: BTreeMap::new(),
        }
    }
}

/// A received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opened payload
    pub payload: Bytes,
    /// Reply address
    pub context: MessageContext,
    /// Payload type announced by the sender
    pub payload_type: Option<String>,
    /// Sender metadata
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// One established session
pub struct Session {
    id: u64,
    role: SessionRole,
    local: Name,
    remote: Name,
    state: SessionState,
    link: Arc<ConnectionShared>,
    inbox: mpsc::UnboundedReceiver<InboundEvent>,
    key: Option<GroupKey>,
    config: SessionConfig,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        role: SessionRole,
        local: Name,
        remote: Name,
        link: Arc<ConnectionShared>,
        inbox: mpsc::UnboundedReceiver<InboundEvent>,
        key: Option<GroupKey>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            role,
            local,
            remote,
            state: SessionState::Active,
            link,
            inbox,
            key,
            config,
        }
    }

    /// Wire id shared by both peers
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Which side this is
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Local name
    pub fn local(&self) -> &Name {
        &self.local
    }

    /// Remote name
    pub fn remote(&self) -> &Name {
        &self.remote
    }

    /// Connection carrying the session
    pub fn connection(&self) -> ConnectionId {
        self.link.id
    }

    /// Whether payloads are sealed
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, next: SessionState) {
        match self.state.transition(next) {
            Ok(state) => self.state = state,
            Err(e) => warn!("Session {}: {}", self.id, e),
        }
    }

    /// Publish a payload and wait until the node acknowledges forwarding it
    ///
    /// With a `context` the message goes to the context's source, otherwise
    /// to the session's remote.
    pub async fn publish_and_wait(
        &self,
        payload: Bytes,
        context: Option<&MessageContext>,
        options: Option<PublishOptions>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::Send(format!(
                "session {} is {}",
                self.id, self.state
            )));
        }

        let dst = context.map(|c| &c.source).unwrap_or(&self.remote);
        let msg_id = self.link.next_msg_id();

        let mut builder = frames::routed(FrameType::Data, self.id, msg_id, &self.local, dst);
        if let Some(options) = &options {
            if let Some(payload_type) = &options.payload_type {
                builder = builder.meta_insert_str(META_PAYLOAD_TYPE, payload_type);
            }
            builder = builder.user_meta(&options.metadata);
        }
        if let Some(key) = &self.key {
            builder = builder.with_crypto(key.seal_params());
        }
        let frame_bytes = builder
            .payload(payload)
            .build(self.link.max_frame)
            .map_err(|e| SessionError::Send(e.to_string()))?;

        let outcome = self
            .link
            .request(msg_id, frame_bytes, self.config.ack_timeout)
            .await
            .map_err(|e| SessionError::Send(e.to_string()))?;

        if outcome.is_ok() {
            Ok(())
        } else {
            Err(SessionError::Send(outcome.describe()))
        }
    }

    /// Wait up to `timeout` for the next message
    ///
    /// A message already queued is returned even with a zero timeout.
    pub async fn get_message(&mut self, timeout: Duration) -> Result<Message, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }

        let event = match self.inbox.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Disconnected) => None,
            Err(TryRecvError::Empty) => {
                if timeout.is_zero() {
                    return Err(SessionError::Timeout(timeout));
                }
                match tokio::time::timeout(timeout, self.inbox.recv()).await {
                    Ok(event) => event,
                    Err(_) => return Err(SessionError::Timeout(timeout)),
                }
            }
        };

        match event {
            Some(InboundEvent::Data(frame)) => self.open_message(frame),
            Some(InboundEvent::Closed { reason }) => {
                debug!("Session {} ended: {}", self.id, reason);
                self.set_state(SessionState::Closed);
                Err(SessionError::SessionClosed)
            }
            None => {
                self.set_state(SessionState::Closed);
                Err(SessionError::SessionClosed)
            }
        }
    }

    fn open_message(&self, frame: Frame) -> Result<Message, SessionError> {
        let meta = parse_meta(&frame.meta_raw).map_err(|e| SessionError::Receive(e.to_string()))?;
        let source = get_meta_str(&meta, META_SRC)
            .ok_or_else(|| SessionError::Receive("message without source".to_string()))?;
        let source =
            Name::parse(&source).map_err(|e| SessionError::Receive(e.to_string()))?;

        let sealed = frame.fast.flags.contains(Flags::E2E_ENC);
        let payload = match (&self.key, sealed) {
            (Some(key), true) => {
                let nonce = get_meta_bytes(&meta, META_NONCE).ok_or_else(|| {
                    SessionError::Receive("sealed payload without nonce".to_string())
                })?;
                key.open(&nonce, &frame.payload_or_cipher)
                    .map_err(|_| SessionError::Receive("payload failed to open".to_string()))?
            }
            (None, false) => frame.payload_or_cipher,
            (Some(_), false) => {
                return Err(SessionError::Receive(
                    "plaintext payload on an encrypted session".to_string(),
                ))
            }
            (None, true) => {
                return Err(SessionError::Receive(
                    "sealed payload on a plaintext session".to_string(),
                ))
            }
        };

        Ok(Message {
            payload,
            context: MessageContext {
                source,
                session_id: frame.fast.session_id,
                message_id: frame.fast.msg_id,
            },
            payload_type: get_meta_str(&meta, META_PAYLOAD_TYPE),
            metadata: get_user_meta(&meta),
        })
    }

    /// Close the session and wait for the node to acknowledge it
    ///
    /// Idempotent. Never fails for a session that is already closed or was
    /// torn down by the peer.
    pub async fn delete_and_wait(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.set_state(SessionState::Closing);
        self.link.unregister_session(self.id);

        let msg_id = self.link.next_msg_id();
        match frames::build_session_close(
            self.id,
            msg_id,
            &self.local,
            &self.remote,
            self.link.max_frame,
        ) {
            Ok(frame_bytes) => {
                match self
                    .link
                    .request(msg_id, frame_bytes, self.config.close_timeout)
                    .await
                {
                    Ok(outcome) if outcome.is_ok() => debug!("Session {} closed", self.id),
                    Ok(outcome) => debug!(
                        "Session {} close not forwarded: {}",
                        self.id,
                        outcome.describe()
                    ),
                    Err(e) => debug!("Session {} close not acknowledged: {}", self.id, e),
                }
            }
            Err(e) => warn!("Failed to build close for session {}: {}", self.id, e),
        }

        self.set_state(SessionState::Closed);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        self.link.unregister_session(self.id);

        // No ACK is requested, nobody is left to wait for it
        match frames::build_session_close(self.id, 0, &self.local, &self.remote, self.link.max_frame)
        {
            Ok(frame_bytes) => {
                if self.link.send(frame_bytes).is_ok() {
                    debug!("Session {} closed on drop", self.id);
                }
            }
            Err(e) => warn!("Failed to build close for session {}: {}", self.id, e),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("connection", &self.link.id)
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use SessionState::*;

        assert_eq!(Created.transition(Establishing), Ok(Establishing));
        assert_eq!(Establishing.transition(Active), Ok(Active));
        assert_eq!(Active.transition(Closing), Ok(Closing));
        assert_eq!(Closing.transition(Closed), Ok(Closed));
        assert_eq!(Active.transition(Closed), Ok(Closed));

        assert!(Closed.transition(Active).is_err());
        assert!(Closing.transition(Active).is_err());
        assert!(Created.transition(Closing).is_err());
        assert_eq!(
            Closed.transition(Closing).unwrap_err().to_string(),
            "illegal session transition closed -> closing"
        );
    }

    #[test]
    fn test_message_text() {
        let message = Message {
            payload: Bytes::from_static(b"odd"),
            context: MessageContext {
                source: Name::parse("org/alice/v1").unwrap(),
                session_id: 1,
                message_id: 2,
            },
            payload_type: None,
            metadata: BTreeMap::new(),
        };
        assert_eq!(message.text(), "odd");
    }

    #[test]
    fn test_publish_options() {
        let options = PublishOptions::with_payload_type("text/plain");
        assert_eq!(options.payload_type.as_deref(), Some("text/plain"));
        assert!(options.metadata.is_empty());
        assert_eq!(SessionConfig::default().handshake_timeout, Duration::from_secs(5));
    }
}
