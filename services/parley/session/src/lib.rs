//! Client side of the parley overlay: connections, sessions and the
//! request/reply loops built on them.
//!
//! An [`App`] holds one local [`Name`](parley_naming::Name), dials overlay
//! nodes, claims its name on a connection and then creates or accepts
//! point-to-point [`Session`]s. Every connection is driven by its own task
//! that answers keepalives, resolves acks and routes inbound frames to the
//! session they belong to.
//!
//! ## Example
//!
//! ```rust,no_run
//! use parley_naming::Name;
//! use parley_session::{App, SessionConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), parley_session::SessionError> {
//! let local = Name::parse("org/alice/v1")?;
//! let remote = Name::parse("org/bob/v1")?;
//! let app = App::new(local.clone(), "an-example-shared-secret-of-32-chars")?;
//!
//! let conn = app.connect("127.0.0.1:46357").await?;
//! app.subscribe(&local, conn).await?;
//! app.set_route(&remote, conn)?;
//!
//! let mut session = app
//!     .create_session_and_wait(SessionConfig::default(), &remote)
//!     .await?;
//! session.publish_and_wait("42".into(), None, None).await?;
//! let reply = session.get_message(Duration::from_secs(5)).await?;
//! println!("{}", reply.text());
//! app.delete_session_and_wait(&mut session).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod frames;
pub mod handshake;
pub mod keepalive;
pub mod session;
pub mod transport;

pub use app::{App, AppConfig};
pub use connection::{ConnectionStats, LinkError};
pub use crypto::{GroupKey, SharedSecret, MIN_SECRET_LEN};
pub use error::SessionError;
pub use exchange::{
    handle_session, odd_even, odd_even_reply, run_accept_loop, run_initiator, serve_session,
    AcceptConfig, AcceptReport, Exchange, InitiatorConfig, InitiatorReport, LoopAction, LoopRole,
    PayloadSource, RandomNumbers, ReplyFn, ServeReport, SessionAcceptor, SessionIo, TEXT_PLAIN,
};
pub use handshake::{accept_hello, client_handshake};
pub use parley_routing::ConnectionId;
pub use session::{
    Message, MessageContext, PublishOptions, Session, SessionConfig, SessionRole, SessionState,
};
pub use transport::{connect_tcp, listen_tcp, Endpoint};
