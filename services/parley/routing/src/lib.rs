//! Name-to-connection route and subscription tables for parley.
//!
//! Clients keep a [`RouteTable`] binding remote names to the connection used
//! to reach them. The overlay node keeps a [`SubscriptionTable`] binding each
//! subscribed name to the connection it arrived on, and routes frames through
//! the [`Router`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod router;
pub mod table;

pub use error::RoutingError;
pub use router::*;
pub use table::*;
