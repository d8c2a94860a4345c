//! # Protocol Stack Integration Tests
//!
//! Shared fixtures for end-to-end tests of the channel lookup stage running
//! inside a protocol stack.
//!
//! ## Test Philosophy
//!
//! - **Deterministic time**: Stacks run on a simulated clock; tests advance it
//!   explicitly and never sleep, except where a real driver thread is tested
//! - **Observe the edges**: Assertions look at what left the stack toward the
//!   transport and the application, plus the lookup stage's diagnostics
//! - **Hostile transport**: Responses arrive late, twice, unasked or garbled

use core_types::{Duration, Instant};
use ipc::{ChannelAvailable, ChannelLocation, ChannelUnavailable, DiscoveryMessage, LookupRequest};
use pipeline::{Protocol, ProtocolContext, ProtocolStack, StageError};
use services_channel_lookup::{ChannelLookupProtocol, LookupConfig, LookupDiagnostics};
use std::cell::RefCell;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once; `RUST_LOG` overrides the default level
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Which way a message was travelling when a tap saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A message seen by a [`TapStage`], with the stack time it passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub at: Instant,
    pub direction: Direction,
    pub message: DiscoveryMessage,
}

/// Shared log of what a [`TapStage`] saw
pub type TapLog = Rc<RefCell<Vec<Observed>>>;

/// A pass-through stage that records traffic in both directions
///
/// Placed below the lookup stage it sees exactly what the lookup stage sends
/// and what the transport delivers, stamped with stack time.
pub struct TapStage {
    name: String,
    context: Option<ProtocolContext<DiscoveryMessage>>,
    log: TapLog,
}

impl TapStage {
    pub fn new(name: impl Into<String>) -> (Self, TapLog) {
        let log = TapLog::default();
        (
            Self {
                name: name.into(),
                context: None,
                log: Rc::clone(&log),
            },
            log,
        )
    }

    fn context(&self) -> Result<&ProtocolContext<DiscoveryMessage>, StageError> {
        self.context.as_ref().ok_or_else(|| StageError::NotStarted {
            stage: self.name.clone(),
        })
    }

    fn record(&self, direction: Direction, message: &DiscoveryMessage) -> Result<Instant, StageError> {
        let at = self.context()?.now();
        self.log.borrow_mut().push(Observed {
            at,
            direction,
            message: message.clone(),
        });
        Ok(at)
    }
}

impl Protocol<DiscoveryMessage> for TapStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, context: ProtocolContext<DiscoveryMessage>) {
        self.context = Some(context);
    }

    fn handle_outgoing(&mut self, message: DiscoveryMessage) -> Result<(), StageError> {
        self.record(Direction::Outgoing, &message)?;
        self.context()?.dispatch_outgoing(message);
        Ok(())
    }

    fn handle_incoming(&mut self, message: DiscoveryMessage) -> Result<(), StageError> {
        self.record(Direction::Incoming, &message)?;
        self.context()?.dispatch_incoming(message);
        Ok(())
    }

    fn stop_requested(&mut self) {
        if let Some(context) = &self.context {
            context.stopped();
        }
    }
}

/// A started stack of lookup stage over a tap, and handles to inspect both
pub struct LookupHarness {
    pub stack: ProtocolStack<DiscoveryMessage>,
    pub diagnostics: LookupDiagnostics,
    pub tap: TapLog,
}

impl LookupHarness {
    pub fn new() -> Self {
        Self::with_config(LookupConfig::default())
    }

    pub fn with_config(config: LookupConfig) -> Self {
        init_tracing();
        let lookup = ChannelLookupProtocol::with_config(config).expect("valid lookup config");
        let diagnostics = lookup.diagnostics();
        let (tap, log) = TapStage::new("tap");

        let mut stack = ProtocolStack::<DiscoveryMessage>::builder()
            .add_stage(lookup)
            .add_stage(tap)
            .build();
        stack.start().expect("stack starts");

        Self {
            stack,
            diagnostics,
            tap: log,
        }
    }

    /// Seconds since stack start at which the tap saw outgoing lookups for `key`
    pub fn lookup_times(&self, key: &str) -> Vec<u64> {
        self.tap
            .borrow()
            .iter()
            .filter(|observed| observed.direction == Direction::Outgoing)
            .filter(|observed| observed.message.channel_key().map(|k| k.as_str()) == Some(key))
            .map(|observed| observed.at.as_nanos() / Duration::from_secs(1).as_nanos())
            .collect()
    }

    /// Advances in fixed steps until `until` has elapsed since start
    pub fn run_until(&mut self, until: Duration, step: Duration) {
        let end = Instant::ZERO + until;
        while self.stack.now() < end {
            self.stack.advance(step).expect("advance");
        }
    }
}

impl Default for LookupHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn lookup(key: &str) -> DiscoveryMessage {
    LookupRequest::new(key).into()
}

pub fn available(key: &str, location: &str) -> DiscoveryMessage {
    ChannelAvailable::new(key, ChannelLocation::new(location)).into()
}

pub fn unavailable(key: &str) -> DiscoveryMessage {
    ChannelUnavailable::new(key).into()
}
