//! The protocol stack and its serialized event loop

use crate::error::PipelineError;
use crate::protocol::{Protocol, ProtocolContext};
use core_types::{Duration, Instant, PipelineId};
use lifecycle::TimerQueue;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, trace};

/// A message waiting to be delivered to a stage
enum StackEvent<M> {
    Outgoing { stage: usize, message: M },
    Incoming { stage: usize, message: M },
}

/// State shared between the stack and the contexts it hands out
pub(crate) struct StackState<M> {
    pub(crate) now: Instant,
    pub(crate) timers: TimerQueue<usize>,
    depth: usize,
    events: VecDeque<StackEvent<M>>,
    stopped: Vec<bool>,
    to_transport: VecDeque<M>,
    to_application: VecDeque<M>,
}

impl<M> StackState<M> {
    fn new() -> Self {
        Self {
            now: Instant::ZERO,
            timers: TimerQueue::new(),
            depth: 0,
            events: VecDeque::new(),
            stopped: Vec::new(),
            to_transport: VecDeque::new(),
            to_application: VecDeque::new(),
        }
    }

    /// Queues `message` for the stage below `from`, or the transport
    pub(crate) fn route_outgoing(&mut self, from: usize, message: M) {
        let next = from + 1;
        if next < self.depth {
            self.events.push_back(StackEvent::Outgoing {
                stage: next,
                message,
            });
        } else {
            self.to_transport.push_back(message);
        }
    }

    /// Queues `message` for the stage above `from`, or the application
    pub(crate) fn route_incoming(&mut self, from: usize, message: M) {
        match from.checked_sub(1) {
            Some(previous) => self.events.push_back(StackEvent::Incoming {
                stage: previous,
                message,
            }),
            None => self.to_application.push_back(message),
        }
    }

    pub(crate) fn mark_stopped(&mut self, stage: usize) {
        if let Some(flag) = self.stopped.get_mut(stage) {
            *flag = true;
        }
    }

    fn all_stopped(&self) -> bool {
        self.stopped.iter().all(|stopped| *stopped)
    }
}

/// Lifecycle of a protocol stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    /// Built but not started; no message may flow
    Idle,
    Running,
    /// Stop requested, waiting for every stage to acknowledge
    Stopping,
    /// Every stage acknowledged; timers canceled
    Stopped,
}

/// Assembles the stages of a [`ProtocolStack`]
///
/// Stages can only be added here. Once built, the chain is fixed, so every
/// stage is started with the stack and takes part in its shutdown.
///
/// A started stack has no way to take another stage:
///
/// ```compile_fail
/// # use pipeline::{Protocol, ProtocolContext, ProtocolStack, StageError};
/// # struct Idle;
/// # impl Protocol<u32> for Idle {
/// #     fn name(&self) -> &str { "idle" }
/// #     fn start(&mut self, _context: ProtocolContext<u32>) {}
/// #     fn handle_outgoing(&mut self, _message: u32) -> Result<(), StageError> { Ok(()) }
/// #     fn handle_incoming(&mut self, _message: u32) -> Result<(), StageError> { Ok(()) }
/// #     fn stop_requested(&mut self) {}
/// # }
/// let mut stack = ProtocolStack::<u32>::builder().build();
/// stack.start().unwrap();
/// stack.add_stage(Idle);
/// ```
pub struct StackBuilder<M> {
    stages: Vec<Box<dyn Protocol<M>>>,
}

impl<M: 'static> StackBuilder<M> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage below the ones already added
    pub fn add_stage(mut self, stage: impl Protocol<M> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Builds an idle stack over the stages added so far
    ///
    /// A stack with no stages passes messages straight through.
    pub fn build(self) -> ProtocolStack<M> {
        let mut state = StackState::new();
        state.depth = self.stages.len();
        state.stopped = vec![false; self.stages.len()];

        ProtocolStack {
            id: PipelineId::new(),
            stages: self.stages,
            shared: Rc::new(RefCell::new(state)),
            status: StackStatus::Idle,
        }
    }
}

impl<M: 'static> Default for StackBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// An ordered chain of stages between an application and a transport
///
/// The stack is the single thread of control for its stages. Each call into
/// it (`send`, `receive`, `advance`) delivers the triggering event and then
/// keeps delivering whatever the stages dispatched until nothing is queued.
///
/// Messages leaving the bottom of the stack are collected for the transport
/// (`drain_outgoing`); messages leaving the top are collected for the
/// application (`drain_incoming`).
pub struct ProtocolStack<M> {
    id: PipelineId,
    stages: Vec<Box<dyn Protocol<M>>>,
    shared: Rc<RefCell<StackState<M>>>,
    status: StackStatus,
}

impl<M: 'static> ProtocolStack<M> {
    pub fn builder() -> StackBuilder<M> {
        StackBuilder::new()
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn status(&self) -> StackStatus {
        self.status
    }

    pub fn is_stopped(&self) -> bool {
        self.status == StackStatus::Stopped
    }

    /// Stage names, top (application side) first
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Current time on this stack's timeline
    pub fn now(&self) -> Instant {
        self.shared.borrow().now
    }

    /// When the earliest scheduled callback is due, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared
            .borrow()
            .timers
            .next_deadline()
            .map(|deadline| deadline.instant())
    }

    /// Number of callbacks still scheduled across all stages
    pub fn scheduled_callbacks(&self) -> usize {
        self.shared.borrow().timers.len()
    }

    /// Hands every stage its context, top to bottom
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self.status {
            StackStatus::Idle => {}
            StackStatus::Stopped => return Err(PipelineError::Stopped),
            StackStatus::Running | StackStatus::Stopping => {
                return Err(PipelineError::AlreadyStarted)
            }
        }

        for (index, stage) in self.stages.iter_mut().enumerate() {
            stage.start(ProtocolContext::new(index, Rc::clone(&self.shared)));
        }
        self.status = StackStatus::Running;

        info!(
            pipeline = %self.id,
            stages = ?self.stage_names(),
            "protocol stack started"
        );
        self.pump()
    }

    /// Sends `message` from the application down through the stack
    pub fn send(&mut self, message: M) -> Result<(), PipelineError> {
        self.ensure_accepting()?;
        self.shared.borrow_mut().route_outgoing_from_top(message);
        self.pump()
    }

    /// Delivers `message` from the transport up through the stack
    pub fn receive(&mut self, message: M) -> Result<(), PipelineError> {
        self.ensure_accepting()?;
        self.shared.borrow_mut().route_incoming_from_bottom(message);
        self.pump()
    }

    /// Messages that left the bottom of the stack, oldest first
    pub fn drain_outgoing(&mut self) -> Vec<M> {
        self.shared.borrow_mut().to_transport.drain(..).collect()
    }

    /// Messages that left the top of the stack, oldest first
    pub fn drain_incoming(&mut self) -> Vec<M> {
        self.shared.borrow_mut().to_application.drain(..).collect()
    }

    /// Moves the clock forward by `delta`, firing every callback that falls due
    pub fn advance(&mut self, delta: Duration) -> Result<(), PipelineError> {
        let target = self.now() + delta;
        self.advance_to(target)
    }

    /// Moves the clock forward to `target`, firing due callbacks in order
    ///
    /// The clock steps to each callback's deadline before it fires, so a
    /// callback scheduled from inside a firing is measured from that deadline.
    /// A target in the past leaves the clock where it is.
    pub fn advance_to(&mut self, target: Instant) -> Result<(), PipelineError> {
        if self.status == StackStatus::Idle {
            return Err(PipelineError::NotStarted);
        }

        loop {
            let fired = {
                let mut shared = self.shared.borrow_mut();
                match shared.timers.next_deadline() {
                    Some(deadline) if deadline.has_passed(target) => {
                        if deadline.instant() > shared.now {
                            shared.now = deadline.instant();
                        }
                        let now = shared.now;
                        shared.timers.pop_due(now)
                    }
                    _ => None,
                }
            };

            let Some((owner, callback)) = fired else {
                break;
            };
            trace!(pipeline = %self.id, stage = owner, callback = %callback.id(), "callback fired");

            let stage = &mut self.stages[owner];
            stage
                .handle_callback(callback.id())
                .map_err(|source| PipelineError::Stage {
                    stage: stage.name().to_string(),
                    source,
                })?;
            self.pump()?;
        }

        let mut shared = self.shared.borrow_mut();
        if target > shared.now {
            shared.now = target;
        }
        Ok(())
    }

    /// Asks every stage to stop
    ///
    /// The stack reaches [`StackStatus::Stopped`] once each stage has called
    /// [`ProtocolContext::stopped`]. That may already be true on return, or it
    /// may happen later from a callback. Stopping a stopped stack is a no-op.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        match self.status {
            StackStatus::Idle => {
                self.status = StackStatus::Stopped;
                return Ok(());
            }
            StackStatus::Stopping | StackStatus::Stopped => return Ok(()),
            StackStatus::Running => {}
        }

        info!(pipeline = %self.id, "protocol stack stopping");
        self.status = StackStatus::Stopping;
        for stage in self.stages.iter_mut() {
            stage.stop_requested();
        }
        self.pump()
    }

    fn ensure_accepting(&self) -> Result<(), PipelineError> {
        match self.status {
            StackStatus::Idle => Err(PipelineError::NotStarted),
            StackStatus::Stopped => Err(PipelineError::Stopped),
            StackStatus::Running | StackStatus::Stopping => Ok(()),
        }
    }

    /// Delivers queued events until none remain
    fn pump(&mut self) -> Result<(), PipelineError> {
        loop {
            let event = self.shared.borrow_mut().events.pop_front();
            let Some(event) = event else {
                break;
            };

            let (index, result) = match event {
                StackEvent::Outgoing { stage, message } => {
                    trace!(pipeline = %self.id, stage, "delivering outgoing message");
                    (stage, self.stages[stage].handle_outgoing(message))
                }
                StackEvent::Incoming { stage, message } => {
                    trace!(pipeline = %self.id, stage, "delivering incoming message");
                    (stage, self.stages[stage].handle_incoming(message))
                }
            };

            result.map_err(|source| PipelineError::Stage {
                stage: self.stages[index].name().to_string(),
                source,
            })?;
        }

        // stages cancel through their handles; drop those entries here
        self.shared.borrow_mut().timers.purge_canceled();
        self.complete_stop();
        Ok(())
    }

    fn complete_stop(&mut self) {
        if self.status != StackStatus::Stopping || !self.shared.borrow().all_stopped() {
            return;
        }

        let canceled = {
            let mut shared = self.shared.borrow_mut();
            shared.events.clear();
            shared.timers.cancel_all()
        };
        self.status = StackStatus::Stopped;
        debug!(pipeline = %self.id, canceled, "canceled outstanding callbacks");
        info!(pipeline = %self.id, "protocol stack stopped");
    }
}

impl<M> StackState<M> {
    fn route_outgoing_from_top(&mut self, message: M) {
        if self.depth == 0 {
            self.to_transport.push_back(message);
        } else {
            self.events.push_back(StackEvent::Outgoing { stage: 0, message });
        }
    }

    fn route_incoming_from_bottom(&mut self, message: M) {
        match self.depth.checked_sub(1) {
            Some(last) => self.events.push_back(StackEvent::Incoming {
                stage: last,
                message,
            }),
            None => self.to_application.push_back(message),
        }
    }
}

impl<M> fmt::Debug for ProtocolStack<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolStack")
            .field("id", &self.id)
            .field("stages", &self.stages.len())
            .field("status", &self.status)
            .finish()
    }
}
