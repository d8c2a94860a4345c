//! # Pipeline
//!
//! Bidirectional protocol stacks: chains of stages sitting between an
//! application and a transport.
//!
//! ## Philosophy
//!
//! - **One thread of control**: Every entry into a stack (a message from
//!   either side, a fired timer) runs to completion before the next one
//!   starts. Stages never need locks.
//! - **Queued dispatch**: A stage forwarding a message does not call its
//!   neighbour directly. The message is queued and delivered by the stack, so
//!   stages are never re-entered.
//! - **Explicit timers**: Scheduling returns a [`lifecycle::Callback`] whose
//!   state can be inspected and canceled. Firing is marshalled back onto the
//!   stack's timeline.
//! - **Deterministic under test**: Time only moves when the host says so.
//!
//! ## Core Concepts
//!
//! - [`Protocol`]: The contract every stage implements
//! - [`ProtocolContext`]: A stage's view of the stack it lives in
//! - [`StackBuilder`]: Fixes the chain of stages before anything runs
//! - [`ProtocolStack`]: Ordered stages plus the serialized event loop
//! - [`StackDriver`]: Hosts a stack on its own thread against real time
//!
//! Stage 0 is nearest the application. The last stage is nearest the
//! transport. "Outgoing" flows from application to transport, "incoming"
//! the other way.

pub mod driver;
pub mod error;
pub mod protocol;
pub mod stack;

pub use driver::{DriverError, StackDriver, StackOutput};
pub use error::{PipelineError, StageError};
pub use protocol::{Protocol, ProtocolContext};
pub use stack::{ProtocolStack, StackBuilder, StackStatus};
