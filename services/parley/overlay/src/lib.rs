//! Overlay node for parley.
//!
//! The node authorises clients with the HELLO challenge, keeps the table of
//! which connection subscribed which name and forwards routed frames to the
//! subscriber of their destination, acknowledging every request to its
//! sender.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod node;

pub use error::OverlayError;
pub use node::{NodeConfig, OverlayNode, DEFAULT_LISTEN};
