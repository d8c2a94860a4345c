//! # Discovery Messages
//!
//! This crate defines the messages exchanged on the channel discovery
//! conversation between cooperating processes.
//!
//! ## Philosophy
//!
//! - **Closed set**: A discovery message is one of a fixed set of variants.
//!   Anything a peer sends that this side does not understand is carried as an
//!   explicit [`DiscoveryMessage::Unrecognized`] value, never silently coerced.
//! - **Correlated by key**: Requests and responses are matched by
//!   [`ChannelKey`] alone. There is no request id, so duplicate or late
//!   responses are indistinguishable from timely ones.
//! - **Opaque locations**: A [`ChannelLocation`] is whatever address the
//!   transport uses. Discovery never interprets it.
//!
//! The bytes-on-the-wire encoding belongs to the transport. The serde derives
//! exist so hosts and tests can move messages across their own boundaries.

pub mod channel;
pub mod discovery;

pub use channel::{ChannelKey, ChannelLocation};
pub use discovery::{ChannelAvailable, ChannelUnavailable, DiscoveryMessage, LookupRequest};
