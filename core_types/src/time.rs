//! Virtual clock types
//!
//! A protocol stack never reads a wall clock directly. It is handed the
//! current [`Instant`] by its host: a test advances it by hand, the threaded
//! driver derives it from elapsed real time. Both views share these types.

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

/// A point on a stack's timeline
///
/// Nanoseconds since the stack was created. Opaque outside this module so
/// callers cannot confuse it with POSIX time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    /// The start of every timeline
    pub const ZERO: Instant = Instant { nanos: 0 };

    /// Creates an instant from nanoseconds since the timeline origin
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Maps elapsed wall-clock time onto the timeline
    pub fn from_elapsed(elapsed: std::time::Duration) -> Self {
        Self::from_nanos(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Returns nanoseconds since the timeline origin
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the duration since an earlier instant, or zero if `earlier` is later
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_add(duration.as_nanos()))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_sub(duration.as_nanos()))
    }
}

/// A span of virtual time
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { nanos: 0 };

    /// Creates a duration from nanoseconds
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Creates a duration from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    /// Creates a duration from seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs.saturating_mul(1_000_000_000),
        }
    }

    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    pub const fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    pub const fn as_secs(&self) -> u64 {
        self.nanos / 1_000_000_000
    }

    pub const fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// Converts to a standard library duration for blocking waits
    pub const fn to_std(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.nanos)
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, other: Duration) -> Self::Output {
        Duration::from_nanos(self.nanos.saturating_add(other.nanos))
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, other: Duration) -> Self::Output {
        Duration::from_nanos(self.nanos.saturating_sub(other.nanos))
    }
}
