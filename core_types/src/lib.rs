//! # Core Types
//!
//! Fundamental types shared by every crate in the discovery workspace.
//!
//! ## Philosophy
//!
//! - **Explicit identity**: Each protocol stack carries a typed identifier,
//!   never a bare string, so that log output from independent stacks can be
//!   told apart.
//! - **Virtual time**: Time is an opaque, monotonic quantity. Hosts decide how
//!   it maps onto a wall clock; tests drive it by hand.
//!
//! ## Key Types
//!
//! - [`PipelineId`]: Unique identifier for one protocol stack instance
//! - [`Instant`] / [`Duration`]: Virtual clock types

pub mod ids;
pub mod time;

pub use ids::PipelineId;
pub use time::{Duration, Instant};
