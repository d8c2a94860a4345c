//! The stage contract and the context a stage talks to its stack through

use crate::error::StageError;
use crate::stack::StackState;
use core_types::{Duration, Instant};
use lifecycle::{Callback, CallbackId, Deadline};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A stage in a protocol stack
///
/// The stack guarantees that `start` runs exactly once, before any other
/// entry point, and that no two entry points of one stage ever overlap.
///
/// ## Example
///
/// ```
/// use pipeline::{Protocol, ProtocolContext, ProtocolStack, StageError};
///
/// struct Upper {
///     context: Option<ProtocolContext<String>>,
/// }
///
/// impl Protocol<String> for Upper {
///     fn name(&self) -> &str {
///         "upper"
///     }
///
///     fn start(&mut self, context: ProtocolContext<String>) {
///         self.context = Some(context);
///     }
///
///     fn handle_outgoing(&mut self, message: String) -> Result<(), StageError> {
///         let context = self.context.as_ref().ok_or_else(|| StageError::NotStarted {
///             stage: self.name().to_string(),
///         })?;
///         context.dispatch_outgoing(message.to_uppercase());
///         Ok(())
///     }
///
///     fn handle_incoming(&mut self, message: String) -> Result<(), StageError> {
///         if let Some(context) = &self.context {
///             context.dispatch_incoming(message);
///         }
///         Ok(())
///     }
///
///     fn stop_requested(&mut self) {
///         if let Some(context) = &self.context {
///             context.stopped();
///         }
///     }
/// }
///
/// let mut stack = ProtocolStack::<String>::builder()
///     .add_stage(Upper { context: None })
///     .build();
/// stack.start().unwrap();
/// stack.send("hello".to_string()).unwrap();
/// assert_eq!(stack.drain_outgoing(), vec!["HELLO".to_string()]);
/// ```
pub trait Protocol<M> {
    /// Human-readable name for diagnostics
    fn name(&self) -> &str;

    /// Called once before any message flows; the stage keeps `context`
    fn start(&mut self, context: ProtocolContext<M>);

    /// The layer above wants `message` sent toward the transport
    fn handle_outgoing(&mut self, message: M) -> Result<(), StageError>;

    /// `message` arrived from the transport side
    fn handle_incoming(&mut self, message: M) -> Result<(), StageError>;

    /// A callback this stage scheduled through its context has fired
    ///
    /// Only callbacks that were still scheduled at their deadline arrive here;
    /// canceled ones never do.
    fn handle_callback(&mut self, callback: CallbackId) -> Result<(), StageError> {
        let _ = callback;
        Ok(())
    }

    /// The stack is shutting down
    ///
    /// The stage must call [`ProtocolContext::stopped`], now or later.
    fn stop_requested(&mut self);
}

/// A stage's handle on its stack
///
/// Cheap to clone. Every operation is queued onto the stack's timeline and
/// takes effect after the current entry point returns, in order.
pub struct ProtocolContext<M> {
    stage: usize,
    shared: Rc<RefCell<StackState<M>>>,
}

impl<M> ProtocolContext<M> {
    pub(crate) fn new(stage: usize, shared: Rc<RefCell<StackState<M>>>) -> Self {
        Self { stage, shared }
    }

    /// Forwards `message` toward the transport, past this stage
    pub fn dispatch_outgoing(&self, message: M) {
        self.shared.borrow_mut().route_outgoing(self.stage, message);
    }

    /// Forwards `message` toward the application, past this stage
    pub fn dispatch_incoming(&self, message: M) {
        self.shared.borrow_mut().route_incoming(self.stage, message);
    }

    /// Schedules this stage's `handle_callback` to run once after `delay`
    ///
    /// Canceling the returned handle before it fires guarantees the callback
    /// never runs.
    pub fn callback_later(&self, delay: Duration) -> Callback {
        let mut shared = self.shared.borrow_mut();
        let deadline = Deadline::after(shared.now, delay);
        shared.timers.schedule(self.stage, deadline)
    }

    /// Reports that this stage has finished shutting down
    pub fn stopped(&self) {
        self.shared.borrow_mut().mark_stopped(self.stage);
    }

    /// Current time on the stack's timeline
    pub fn now(&self) -> Instant {
        self.shared.borrow().now
    }
}

impl<M> Clone for ProtocolContext<M> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for ProtocolContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}
