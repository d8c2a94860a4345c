//! Retry configuration for channel lookups
//!
//! Configuration is typed and versioned, and loaded from JSON by whoever
//! assembles the stack. There are no environment variables or global files.

use core_types::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Escalating resend cadence for an unanswered lookup
///
/// Attempt numbers are 1-based and count sends already made when the next
/// retry is scheduled. Up to `fast_attempts` the next retry waits
/// `fast_delay_ms`; up to `slow_attempts` it waits `slow_delay_ms`; after that
/// every retry waits `steady_delay_ms`, forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySchedule {
    pub fast_attempts: u32,
    pub fast_delay_ms: u64,
    pub slow_attempts: u32,
    pub slow_delay_ms: u64,
    pub steady_delay_ms: u64,
}

impl RetrySchedule {
    /// Delay before the retry that follows attempt number `attempt`
    ///
    /// Attempt 0 has not been sent yet and is treated like the first.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = if attempt <= self.fast_attempts {
            self.fast_delay_ms
        } else if attempt <= self.slow_attempts {
            self.slow_delay_ms
        } else {
            self.steady_delay_ms
        };
        Duration::from_millis(millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fast_attempts > self.slow_attempts {
            return Err(ConfigError::TierOrder {
                fast_attempts: self.fast_attempts,
                slow_attempts: self.slow_attempts,
            });
        }
        for (tier, delay) in [
            ("fast", self.fast_delay_ms),
            ("slow", self.slow_delay_ms),
            ("steady", self.steady_delay_ms),
        ] {
            if delay == 0 {
                return Err(ConfigError::ZeroDelay { tier });
            }
        }
        Ok(())
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            fast_attempts: 5,
            fast_delay_ms: 1_000,
            slow_attempts: 10,
            slow_delay_ms: 10_000,
            steady_delay_ms: 30_000,
        }
    }
}

/// Configuration for a channel lookup stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Version of the configuration format
    pub version: u32,
    pub retry: RetrySchedule,
}

impl LookupConfig {
    pub const CURRENT_VERSION: u32 = 1;

    /// Parses and validates a configuration document
    ///
    /// Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: LookupConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
            });
        }
        self.retry.validate()
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            retry: RetrySchedule::default(),
        }
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed lookup configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported lookup configuration version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("fast_attempts ({fast_attempts}) must not exceed slow_attempts ({slow_attempts})")]
    TierOrder {
        fast_attempts: u32,
        slow_attempts: u32,
    },

    #[error("The {tier} retry delay must be non-zero")]
    ZeroDelay { tier: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_tiers() {
        let schedule = RetrySchedule::default();
        for attempt in 1..=5 {
            assert_eq!(schedule.delay_for(attempt), Duration::from_secs(1), "attempt {attempt}");
        }
        for attempt in 6..=10 {
            assert_eq!(schedule.delay_for(attempt), Duration::from_secs(10), "attempt {attempt}");
        }
        for attempt in [11, 12, 50, 1_000, u32::MAX] {
            assert_eq!(schedule.delay_for(attempt), Duration::from_secs(30), "attempt {attempt}");
        }
    }

    #[test]
    fn test_attempt_zero_uses_first_tier() {
        assert_eq!(RetrySchedule::default().delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(LookupConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = LookupConfig::from_json(r#"{"retry": {"fast_delay_ms": 250}}"#).unwrap();
        assert_eq!(config.version, LookupConfig::CURRENT_VERSION);
        assert_eq!(config.retry.fast_delay_ms, 250);
        assert_eq!(config.retry.fast_attempts, 5);
        assert_eq!(config.retry.steady_delay_ms, 30_000);
    }

    #[test]
    fn test_json_round_trip() {
        let config = LookupConfig::default();
        let json = config.to_json().unwrap();
        assert_eq!(LookupConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_inverted_tiers() {
        let err = LookupConfig::from_json(r#"{"retry": {"fast_attempts": 12}}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TierOrder {
                fast_attempts: 12,
                slow_attempts: 10
            }
        ));
    }

    #[test]
    fn test_rejects_zero_delay() {
        let err = LookupConfig::from_json(r#"{"retry": {"steady_delay_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDelay { tier: "steady" }));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let err = LookupConfig::from_json(r#"{"version": 7}"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 7 }));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = LookupConfig::from_json("{retry").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
