//! # Channel Lookup Service
//!
//! A protocol stage that turns a single outgoing lookup request into a
//! retried, correlated conversation over a broadcast transport.
//!
//! ## Philosophy
//!
//! - **Tolerate the transport**: Broadcast delivery is unordered, lossy and
//!   may duplicate. The stage resends until answered and ignores anything it
//!   cannot use.
//! - **Exactly one answer**: Each pending lookup delivers at most one
//!   `ChannelAvailable` to the application. The entry is gone before the
//!   answer is dispatched, so duplicates find nothing to match.
//! - **Liveness over failure**: An unanswered lookup is not an error. It is
//!   retried forever at an escalating cadence.
//! - **Per-stack state**: Pending lookups belong to one stage instance. Two
//!   stacks in one process never see each other's requests.
//!
//! ## Lifecycle of a channel key
//!
//! ```text
//! Untracked ──outgoing LookupRequest──► Pending ──matching ChannelAvailable──► Resolved
//!                                        │  ▲
//!                                        └──┘ retry callback
//! ```
//!
//! `ChannelUnavailable` does not move a key out of `Pending`.

pub mod config;

pub use config::{ConfigError, LookupConfig, RetrySchedule};

use ipc::{ChannelAvailable, ChannelKey, DiscoveryMessage, LookupRequest};
use lifecycle::{Callback, CallbackId};
use pipeline::{Protocol, ProtocolContext, StageError};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, trace, warn};

const STAGE_NAME: &str = "channel-lookup";

/// Counters describing what a lookup stage has done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// Outgoing lookup requests accepted from the application
    pub requests: u64,
    /// Lookup requests sent toward the transport, first sends and retries
    pub attempts: u64,
    /// Lookups answered and delivered to the application
    pub resolved: u64,
    /// `ChannelAvailable` with no pending lookup for its key
    pub discarded_unmatched: u64,
    /// Incoming `LookupRequest` and `ChannelUnavailable`
    pub discarded_ignored: u64,
    /// Incoming messages of a kind this stage does not know
    pub discarded_unrecognized: u64,
    /// Fired callbacks whose lookup was no longer pending
    pub stale_callbacks: u64,
    /// Pending lookups replaced by a newer request for the same key
    pub replaced: u64,
}

#[derive(Debug, Default)]
struct Snapshot {
    pending: BTreeMap<ChannelKey, u32>,
    stats: LookupStats,
}

/// Read-only view of a lookup stage, for hosts and tests
///
/// The stage publishes a snapshot after every entry point. The view holds a
/// copy; it cannot reach or change the stage's pending lookups.
#[derive(Debug, Clone, Default)]
pub struct LookupDiagnostics {
    snapshot: Rc<RefCell<Snapshot>>,
}

impl LookupDiagnostics {
    pub fn stats(&self) -> LookupStats {
        self.snapshot.borrow().stats
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.snapshot.borrow().pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.snapshot.borrow().pending.len()
    }

    /// Sends made so far for a pending lookup
    pub fn attempts(&self, key: &str) -> Option<u32> {
        self.snapshot.borrow().pending.get(key).copied()
    }

    /// Pending channel keys in sorted order
    pub fn pending_keys(&self) -> Vec<ChannelKey> {
        self.snapshot.borrow().pending.keys().cloned().collect()
    }
}

/// An outstanding lookup for one channel key
#[derive(Debug)]
struct PendingRequest {
    request: LookupRequest,
    attempts: u32,
    active_timer: Option<Callback>,
}

impl PendingRequest {
    fn new(request: LookupRequest) -> Self {
        Self {
            request,
            attempts: 0,
            active_timer: None,
        }
    }
}

/// The channel lookup stage
///
/// Outgoing, it accepts only `LookupRequest`. Incoming, it forwards a
/// `ChannelAvailable` that answers a pending lookup and silently drops
/// everything else.
///
/// A second outgoing request for a key that is still pending replaces the
/// first: the old retry timer is canceled, the attempt count restarts and the
/// new request is sent at once.
pub struct ChannelLookupProtocol {
    config: LookupConfig,
    context: Option<ProtocolContext<DiscoveryMessage>>,
    pending: HashMap<ChannelKey, PendingRequest>,
    timers: HashMap<CallbackId, ChannelKey>,
    stats: LookupStats,
    diagnostics: LookupDiagnostics,
}

impl ChannelLookupProtocol {
    /// Creates a stage with the default retry schedule
    pub fn new() -> Self {
        Self {
            config: LookupConfig::default(),
            context: None,
            pending: HashMap::new(),
            timers: HashMap::new(),
            stats: LookupStats::default(),
            diagnostics: LookupDiagnostics::default(),
        }
    }

    /// Creates a stage with a custom configuration
    pub fn with_config(config: LookupConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    /// A view that stays valid after the stage is moved into a stack
    pub fn diagnostics(&self) -> LookupDiagnostics {
        self.diagnostics.clone()
    }

    fn context(&self) -> Result<&ProtocolContext<DiscoveryMessage>, StageError> {
        self.context.as_ref().ok_or_else(|| StageError::NotStarted {
            stage: STAGE_NAME.to_string(),
        })
    }

    /// Sends the pending request for `key` and arms its next retry
    fn attempt(&mut self, key: &ChannelKey) -> Result<(), StageError> {
        let context = self.context.as_ref().ok_or_else(|| StageError::NotStarted {
            stage: STAGE_NAME.to_string(),
        })?;
        let Some(pending) = self.pending.get_mut(key) else {
            return Ok(());
        };

        pending.attempts += 1;
        let delay = self.config.retry.delay_for(pending.attempts);
        let callback = context.callback_later(delay);
        self.timers.insert(callback.id(), key.clone());
        pending.active_timer = Some(callback);
        self.stats.attempts += 1;

        debug!(
            channel = %key,
            attempt = pending.attempts,
            next_retry_ms = delay.as_millis(),
            "broadcasting lookup request"
        );
        context.dispatch_outgoing(DiscoveryMessage::LookupRequest(pending.request.clone()));
        Ok(())
    }

    /// Cancels a pending request's timer and forgets it
    fn retire(&mut self, pending: PendingRequest) {
        if let Some(timer) = pending.active_timer {
            timer.cancel();
            self.timers.remove(&timer.id());
        }
    }

    fn resolve(&mut self, available: ChannelAvailable) -> Result<(), StageError> {
        let Some(pending) = self.pending.remove(&available.channel_key) else {
            self.stats.discarded_unmatched += 1;
            debug!(channel = %available.channel_key, location = %available.location, "channel discovered, ignoring");
            return Ok(());
        };

        let attempts = pending.attempts;
        self.retire(pending);
        self.stats.resolved += 1;
        debug!(
            channel = %available.channel_key,
            location = %available.location,
            attempts,
            "channel discovered"
        );
        self.context()?
            .dispatch_incoming(DiscoveryMessage::ChannelAvailable(available));
        Ok(())
    }

    fn publish(&self) {
        let mut snapshot = self.diagnostics.snapshot.borrow_mut();
        snapshot.stats = self.stats;
        snapshot.pending = self
            .pending
            .iter()
            .map(|(key, pending)| (key.clone(), pending.attempts))
            .collect();
    }
}

impl Default for ChannelLookupProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol<DiscoveryMessage> for ChannelLookupProtocol {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    fn start(&mut self, context: ProtocolContext<DiscoveryMessage>) {
        self.context = Some(context);
    }

    fn handle_outgoing(&mut self, message: DiscoveryMessage) -> Result<(), StageError> {
        let request = match message {
            DiscoveryMessage::LookupRequest(request) => request,
            other @ (DiscoveryMessage::ChannelAvailable(_)
            | DiscoveryMessage::ChannelUnavailable(_)
            | DiscoveryMessage::Unrecognized { .. }) => {
                warn!(message = %other, "rejecting outgoing message that is not a lookup request");
                return Err(StageError::UnsupportedOutgoing {
                    stage: STAGE_NAME.to_string(),
                    kind: other.kind().to_string(),
                });
            }
        };
        self.context()?;

        let key = request.channel_key.clone();
        if let Some(previous) = self.pending.remove(&key) {
            warn!(
                channel = %key,
                previous_attempts = previous.attempts,
                "replacing pending lookup for the same channel"
            );
            self.stats.replaced += 1;
            self.retire(previous);
        }

        self.stats.requests += 1;
        self.pending.insert(key.clone(), PendingRequest::new(request));
        let result = self.attempt(&key);
        self.publish();
        result
    }

    fn handle_incoming(&mut self, message: DiscoveryMessage) -> Result<(), StageError> {
        let result = match message {
            DiscoveryMessage::ChannelAvailable(available) => self.resolve(available),
            DiscoveryMessage::LookupRequest(_) | DiscoveryMessage::ChannelUnavailable(_) => {
                self.stats.discarded_ignored += 1;
                trace!(message = %message, "ignoring discovery message");
                Ok(())
            }
            DiscoveryMessage::Unrecognized { ref kind } => {
                self.stats.discarded_unrecognized += 1;
                debug!(kind = %kind, "received unknown discovery message, discarding");
                Ok(())
            }
        };
        self.publish();
        result
    }

    fn handle_callback(&mut self, callback: CallbackId) -> Result<(), StageError> {
        let result = match self.timers.remove(&callback) {
            Some(key) => {
                trace!(channel = %key, callback = %callback, "lookup retry due");
                self.attempt(&key)
            }
            None => {
                self.stats.stale_callbacks += 1;
                debug!(callback = %callback, "retry fired for a lookup that is no longer pending");
                Ok(())
            }
        };
        self.publish();
        result
    }

    fn stop_requested(&mut self) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "stopping with lookups still pending");
        }
        if let Some(context) = &self.context {
            context.stopped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{Duration, Instant};
    use ipc::{ChannelLocation, ChannelUnavailable};
    use pipeline::{PipelineError, ProtocolStack, StackStatus};

    fn lookup_stack() -> (ProtocolStack<DiscoveryMessage>, LookupDiagnostics) {
        let stage = ChannelLookupProtocol::new();
        let diagnostics = stage.diagnostics();
        let mut stack = ProtocolStack::<DiscoveryMessage>::builder()
            .add_stage(stage)
            .build();
        stack.start().unwrap();
        (stack, diagnostics)
    }

    fn lookup(key: &str) -> DiscoveryMessage {
        LookupRequest::new(key).into()
    }

    fn available(key: &str, location: &str) -> DiscoveryMessage {
        ChannelAvailable::new(key, ChannelLocation::new(location)).into()
    }

    #[test]
    fn test_first_attempt_is_immediate() {
        let (mut stack, diagnostics) = lookup_stack();

        stack.send(lookup("build-events")).unwrap();

        assert_eq!(stack.drain_outgoing(), vec![lookup("build-events")]);
        assert_eq!(diagnostics.attempts("build-events"), Some(1));
        assert_eq!(stack.scheduled_callbacks(), 1);
        assert_eq!(stack.next_deadline(), Some(Instant::ZERO + Duration::from_secs(1)));
    }

    #[test]
    fn test_matching_response_resolves_and_cancels_retry() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("build-events")).unwrap();
        stack.drain_outgoing();

        stack.advance(Duration::from_millis(400)).unwrap();
        stack.receive(available("build-events", "tcp://a")).unwrap();

        assert_eq!(stack.drain_incoming(), vec![available("build-events", "tcp://a")]);
        assert!(!diagnostics.is_pending("build-events"));
        assert_eq!(stack.scheduled_callbacks(), 0);

        stack.advance(Duration::from_secs(120)).unwrap();
        assert!(stack.drain_outgoing().is_empty());
        assert_eq!(diagnostics.stats().resolved, 1);
    }

    #[test]
    fn test_duplicate_response_delivered_once() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();

        stack.receive(available("x", "tcp://a")).unwrap();
        stack.receive(available("x", "tcp://b")).unwrap();

        assert_eq!(stack.drain_incoming(), vec![available("x", "tcp://a")]);
        let stats = diagnostics.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.discarded_unmatched, 1);
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();

        stack.receive(available("y", "tcp://a")).unwrap();

        assert!(stack.drain_incoming().is_empty());
        assert!(diagnostics.is_pending("x"));
        assert_eq!(diagnostics.stats().discarded_unmatched, 1);
    }

    #[test]
    fn test_unavailable_and_foreign_requests_are_ignored() {
        let (mut stack, diagnostics) = lookup_stack();
        stack
            .receive(ChannelUnavailable::new("x").into())
            .unwrap();
        stack.send(lookup("x")).unwrap();
        stack
            .receive(ChannelUnavailable::new("x").into())
            .unwrap();
        stack.receive(lookup("x")).unwrap();

        assert!(stack.drain_incoming().is_empty());
        assert_eq!(diagnostics.attempts("x"), Some(1));
        assert_eq!(diagnostics.stats().discarded_ignored, 3);
    }

    #[test]
    fn test_unrecognized_incoming_is_dropped() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();

        stack
            .receive(DiscoveryMessage::Unrecognized {
                kind: "heartbeat".to_string(),
            })
            .unwrap();

        assert!(stack.drain_incoming().is_empty());
        assert!(diagnostics.is_pending("x"));
        assert_eq!(diagnostics.stats().discarded_unrecognized, 1);
    }

    #[test]
    fn test_decoded_foreign_kind_is_dropped() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();

        let decoded: DiscoveryMessage =
            serde_json::from_str(r#"{"type":"heartbeat","channel_key":"x"}"#).unwrap();
        stack.receive(decoded).unwrap();

        assert!(stack.drain_incoming().is_empty());
        assert!(diagnostics.is_pending("x"));
        assert_eq!(diagnostics.stats().discarded_unrecognized, 1);
    }

    #[test]
    fn test_outgoing_non_request_rejected_without_side_effects() {
        let (mut stack, diagnostics) = lookup_stack();

        for message in [
            available("x", "tcp://a"),
            ChannelUnavailable::new("x").into(),
            DiscoveryMessage::Unrecognized {
                kind: "ping".to_string(),
            },
        ] {
            let kind = message.kind().to_string();
            let err = stack.send(message).unwrap_err();
            assert_eq!(
                err,
                PipelineError::Stage {
                    stage: "channel-lookup".to_string(),
                    source: StageError::UnsupportedOutgoing {
                        stage: "channel-lookup".to_string(),
                        kind,
                    },
                }
            );
        }

        assert!(stack.drain_outgoing().is_empty());
        assert_eq!(stack.scheduled_callbacks(), 0);
        assert_eq!(diagnostics.pending_count(), 0);
    }

    #[test]
    fn test_retries_follow_schedule() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();
        stack.drain_outgoing();

        let mut sent_at = Vec::new();
        for _ in 0..90 {
            stack.advance(Duration::from_secs(1)).unwrap();
            if !stack.drain_outgoing().is_empty() {
                sent_at.push(stack.now().as_nanos() / 1_000_000_000);
            }
        }

        assert_eq!(sent_at, vec![1, 2, 3, 4, 5, 15, 25, 35, 45, 55, 85]);
        assert_eq!(diagnostics.attempts("x"), Some(12));
    }

    #[test]
    fn test_duplicate_key_replaces_pending_request() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();
        stack.advance(Duration::from_millis(4_500)).unwrap();
        assert_eq!(diagnostics.attempts("x"), Some(5));
        stack.drain_outgoing();

        stack.send(lookup("x")).unwrap();

        assert_eq!(stack.drain_outgoing(), vec![lookup("x")]);
        assert_eq!(diagnostics.attempts("x"), Some(1));
        assert_eq!(diagnostics.pending_count(), 1);
        assert_eq!(stack.scheduled_callbacks(), 1);
        assert_eq!(diagnostics.stats().replaced, 1);

        // the old timer was due at 5s; only the new one fires, at 5.5s
        stack.advance(Duration::from_millis(1_200)).unwrap();
        assert_eq!(stack.drain_outgoing(), vec![lookup("x")]);
        assert_eq!(diagnostics.attempts("x"), Some(2));
    }

    #[test]
    fn test_independent_keys() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("a")).unwrap();
        stack.advance(Duration::from_millis(500)).unwrap();
        stack.send(lookup("b")).unwrap();

        stack.receive(available("a", "tcp://a")).unwrap();
        stack.advance(Duration::from_secs(1)).unwrap();

        assert_eq!(diagnostics.pending_keys(), vec![ChannelKey::new("b")]);
        assert_eq!(diagnostics.attempts("b"), Some(2));
    }

    #[test]
    fn test_stop_acknowledges_immediately() {
        let (mut stack, diagnostics) = lookup_stack();
        stack.send(lookup("x")).unwrap();

        stack.stop().unwrap();

        assert_eq!(stack.status(), StackStatus::Stopped);
        assert_eq!(stack.scheduled_callbacks(), 0);
        assert!(diagnostics.is_pending("x"));
    }

    #[test]
    fn test_stale_callback_is_noop() {
        let mut stage = ChannelLookupProtocol::new();
        let diagnostics = stage.diagnostics();

        stage.handle_callback(CallbackId::from_raw(99)).unwrap();

        assert_eq!(diagnostics.stats().stale_callbacks, 1);
    }

    #[test]
    fn test_outgoing_before_start_fails() {
        let mut stage = ChannelLookupProtocol::new();
        let err = stage.handle_outgoing(lookup("x")).unwrap_err();
        assert!(matches!(err, StageError::NotStarted { .. }));
        assert_eq!(stage.diagnostics().pending_count(), 0);
    }

    #[test]
    fn test_custom_schedule() {
        let config = LookupConfig::from_json(
            r#"{"retry": {"fast_attempts": 1, "fast_delay_ms": 100, "slow_attempts": 2, "slow_delay_ms": 200, "steady_delay_ms": 300}}"#,
        )
        .unwrap();
        let stage = ChannelLookupProtocol::with_config(config).unwrap();
        let mut stack = ProtocolStack::<DiscoveryMessage>::builder()
            .add_stage(stage)
            .build();
        stack.start().unwrap();
        stack.send(lookup("x")).unwrap();
        stack.drain_outgoing();

        let mut sent_at = Vec::new();
        for _ in 0..12 {
            stack.advance(Duration::from_millis(100)).unwrap();
            if !stack.drain_outgoing().is_empty() {
                sent_at.push(stack.now().as_nanos() / 1_000_000);
            }
        }
        assert_eq!(sent_at, vec![100, 300, 600, 900, 1_200]);
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let mut config = LookupConfig::default();
        config.retry.fast_delay_ms = 0;
        assert!(ChannelLookupProtocol::with_config(config).is_err());
    }
}
