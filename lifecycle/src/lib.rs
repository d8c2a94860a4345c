//! # Lifecycle
//!
//! Deterministic timed-callback primitives for protocol stacks.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: A scheduled callback is a value with a
//!   visible state, not a closure hidden inside an executor
//! - **Testability first**: Time is supplied by the caller, so tests drive it
//! - **Mechanism not policy**: The queue orders and fires; stages decide what a
//!   firing means
//! - **No async runtime required**: Works in sync contexts
//!
//! ## Core Concepts
//!
//! - `Callback`: Cloneable handle to one scheduled firing
//! - `TimerState`: `Scheduled`, `Canceled` or `Fired`; the only transitions are
//!   out of `Scheduled`
//! - `Deadline`: Point in time when a callback becomes due
//! - `TimerQueue`: Owner-tagged set of callbacks ordered by deadline

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::Cell;
use core::fmt;
use core_types::{Duration, Instant};

/// Identifies one scheduled callback within its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Rebuilds an id from its raw value, for hosts that persist or log ids
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({})", self.0)
    }
}

/// State of a scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting for its deadline
    Scheduled,
    /// Canceled before it fired; it will never fire
    Canceled,
    /// Its deadline passed and it was handed to its owner
    Fired,
}

/// Handle to a scheduled callback
///
/// Clones share state with the queue entry, so canceling through any clone
/// is observed by the queue.
///
/// ## Example
///
/// ```
/// use core_types::Instant;
/// use lifecycle::{Deadline, TimerQueue, TimerState};
///
/// let mut queue = TimerQueue::new();
/// let callback = queue.schedule("retry", Deadline::at(Instant::from_nanos(10)));
///
/// assert!(callback.cancel());
/// assert!(!callback.cancel());
/// assert_eq!(callback.state(), TimerState::Canceled);
/// assert!(queue.pop_due(Instant::from_nanos(10)).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Callback {
    id: CallbackId,
    state: Rc<Cell<TimerState>>,
}

impl Callback {
    fn scheduled(id: CallbackId) -> Self {
        Self {
            id,
            state: Rc::new(Cell::new(TimerState::Scheduled)),
        }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn state(&self) -> TimerState {
        self.state.get()
    }

    pub fn is_scheduled(&self) -> bool {
        self.state() == TimerState::Scheduled
    }

    /// Cancels the callback
    ///
    /// Returns true only for the call that moved it out of `Scheduled`.
    /// Canceling an already canceled or fired callback does nothing.
    pub fn cancel(&self) -> bool {
        if self.is_scheduled() {
            self.state.set(TimerState::Canceled);
            true
        } else {
            false
        }
    }

    fn fire(&self) -> bool {
        if self.is_scheduled() {
            self.state.set(TimerState::Fired);
            true
        } else {
            false
        }
    }
}

/// A deadline represents a point in time when a callback becomes due
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    /// Creates a deadline at the specified instant
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    /// Creates a deadline `delay` after `now`
    pub fn after(now: Instant, delay: Duration) -> Self {
        Self::at(now + delay)
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    /// Checks if the deadline has passed
    pub fn has_passed(&self, now: Instant) -> bool {
        now >= self.instant
    }
}

/// Callbacks ordered by deadline, each tagged with the owner it fires into
///
/// Entries with equal deadlines fire in the order they were scheduled.
/// Canceled entries are dropped lazily, when they reach the front or on
/// [`TimerQueue::purge_canceled`].
#[derive(Debug)]
pub struct TimerQueue<O> {
    entries: BTreeMap<(Deadline, u64), (O, Callback)>,
    next_id: u64,
}

impl<O> TimerQueue<O> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Schedules a callback for `owner` at `deadline`
    pub fn schedule(&mut self, owner: O, deadline: Deadline) -> Callback {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        let callback = Callback::scheduled(id);
        self.entries
            .insert((deadline, id.0), (owner, callback.clone()));
        callback
    }

    /// Deadline of the earliest callback that is still scheduled
    pub fn next_deadline(&self) -> Option<Deadline> {
        self.entries
            .iter()
            .find(|(_, (_, callback))| callback.is_scheduled())
            .map(|((deadline, _), _)| *deadline)
    }

    /// Removes and fires the earliest callback due at `now`
    ///
    /// The returned callback is already in the `Fired` state.
    pub fn pop_due(&mut self, now: Instant) -> Option<(O, Callback)> {
        loop {
            let (&(deadline, _), _) = self.entries.first_key_value()?;
            if !deadline.has_passed(now) {
                return None;
            }
            let (_, (owner, callback)) = self.entries.pop_first()?;
            if callback.fire() {
                return Some((owner, callback));
            }
        }
    }

    /// Cancels every pending callback and empties the queue
    pub fn cancel_all(&mut self) -> usize {
        let mut canceled = 0;
        while let Some((_, (_, callback))) = self.entries.pop_first() {
            if callback.cancel() {
                canceled += 1;
            }
        }
        canceled
    }

    /// Drops entries whose callbacks were canceled through their handles
    pub fn purge_canceled(&mut self) {
        self.entries.retain(|_, (_, callback)| callback.is_scheduled());
    }

    /// Number of callbacks still scheduled
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|(_, callback)| callback.is_scheduled())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<O> Default for TimerQueue<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_secs(secs: u64) -> Deadline {
        Deadline::at(Instant::ZERO + Duration::from_secs(secs))
    }

    fn secs(secs: u64) -> Instant {
        Instant::ZERO + Duration::from_secs(secs)
    }

    #[test]
    fn test_callback_ids_are_distinct() {
        let mut queue = TimerQueue::new();
        let a = queue.schedule(0usize, at_secs(1));
        let b = queue.schedule(0usize, at_secs(1));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_nothing_fires_before_deadline() {
        let mut queue = TimerQueue::new();
        let callback = queue.schedule(7usize, at_secs(1));

        assert!(queue.pop_due(secs(0)).is_none());
        assert!(callback.is_scheduled());

        let (owner, fired) = queue.pop_due(secs(1)).unwrap();
        assert_eq!(owner, 7);
        assert_eq!(fired.id(), callback.id());
        assert_eq!(callback.state(), TimerState::Fired);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fires_in_deadline_then_schedule_order() {
        let mut queue = TimerQueue::new();
        queue.schedule("late", at_secs(3));
        queue.schedule("first", at_secs(1));
        queue.schedule("second", at_secs(1));

        let order: Vec<_> = core::iter::from_fn(|| queue.pop_due(secs(10)))
            .map(|(owner, _)| owner)
            .collect();
        assert_eq!(order, vec!["first", "second", "late"]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut queue = TimerQueue::new();
        let callback = queue.schedule((), at_secs(1));

        assert!(callback.cancel());
        assert!(!callback.cancel());
        assert_eq!(callback.state(), TimerState::Canceled);
        assert!(queue.pop_due(secs(5)).is_none());
    }

    #[test]
    fn test_cancel_through_clone() {
        let mut queue = TimerQueue::new();
        let callback = queue.schedule((), at_secs(1));
        let clone = callback.clone();

        assert!(clone.cancel());
        assert_eq!(callback.state(), TimerState::Canceled);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_fired_callback_cannot_be_canceled() {
        let mut queue = TimerQueue::new();
        let callback = queue.schedule((), at_secs(1));
        queue.pop_due(secs(1)).unwrap();

        assert!(!callback.cancel());
        assert_eq!(callback.state(), TimerState::Fired);
    }

    #[test]
    fn test_next_deadline_skips_canceled() {
        let mut queue = TimerQueue::new();
        let early = queue.schedule((), at_secs(1));
        queue.schedule((), at_secs(4));

        assert_eq!(queue.next_deadline(), Some(at_secs(1)));
        early.cancel();
        assert_eq!(queue.next_deadline(), Some(at_secs(4)));
    }

    #[test]
    fn test_cancel_all() {
        let mut queue = TimerQueue::new();
        let a = queue.schedule((), at_secs(1));
        let b = queue.schedule((), at_secs(2));
        b.cancel();

        assert_eq!(queue.cancel_all(), 1);
        assert_eq!(a.state(), TimerState::Canceled);
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn test_purge_canceled() {
        let mut queue = TimerQueue::new();
        let a = queue.schedule((), at_secs(1));
        queue.schedule((), at_secs(2));
        a.cancel();
        queue.purge_canceled();
        assert_eq!(queue.entries.len(), 1);
    }

    #[test]
    fn test_deadline_has_passed() {
        let deadline = at_secs(2);
        assert!(!deadline.has_passed(secs(1)));
        assert!(deadline.has_passed(secs(2)));
        assert!(deadline.has_passed(secs(3)));
        assert_eq!(Deadline::after(secs(1), Duration::from_secs(1)), deadline);
    }
}
