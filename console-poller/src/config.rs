//! Configuration types for the console-poller crate
//!
//! This module defines the settings shared by every stream in a registry:
//! default and idle polling intervals, the bounds used by the adaptive timing
//! algorithm and the give-up heuristic.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::PollerError;

/// `appConstants` key holding the normal polling interval in milliseconds.
pub const POLLER_INTERVAL_KEY: &str = "console.pollerInterval";

/// `appConstants` key holding the idle polling interval in milliseconds.
pub const IDLE_POLLER_INTERVAL_KEY: &str = "console.idle.pollerInterval";

/// Configuration for a [`PollerRegistry`](crate::PollerRegistry) and its streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Interval every new stream starts with
    /// Default: 10 seconds
    #[serde(with = "duration_ms")]
    pub default_interval: Duration,

    /// Interval applied to all streams while the user is idle
    /// Default: 60 seconds
    #[serde(with = "duration_ms")]
    pub idle_interval: Duration,

    /// Intervals passed to `add` must exceed this to be applied
    /// Default: 1500 milliseconds
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,

    /// Number of failure records kept per stream
    /// Default: 10
    pub error_history_capacity: usize,

    /// Number of inter-fetch durations averaged before adapting the interval
    /// Default: 5
    pub latency_sample_size: usize,

    /// A stream gives up when this many of its most recent attempts failed
    /// Default: 3
    pub give_up_threshold: u64,

    /// Give up on the first permanent failure (401/403)
    /// Default: true
    pub stop_on_permanent_error: bool,

    /// Timeout applied by the HTTP fetch capability
    /// Default: 9 seconds (default interval minus one second)
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(10),
            idle_interval: Duration::from_secs(60),
            min_interval: Duration::from_millis(1500),
            error_history_capacity: 10,
            latency_sample_size: 5,
            give_up_threshold: 3,
            stop_on_permanent_error: true,
            request_timeout: Duration::from_secs(9),
        }
    }
}

impl PollerConfig {
    /// Create a new PollerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PollerConfig for a console that needs near-live status
    pub fn fast_polling() -> Self {
        Self {
            default_interval: Duration::from_secs(3),
            idle_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Create a PollerConfig that keeps server load low
    pub fn resource_efficient() -> Self {
        Self {
            default_interval: Duration::from_secs(30),
            idle_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(29),
            ..Default::default()
        }
    }

    /// Build a configuration from the console's `appConstants` document.
    ///
    /// Values may be JSON numbers or numeric strings, in milliseconds. Missing
    /// or unparsable keys keep their defaults. The request timeout follows the
    /// polling interval, one second shorter. Without an idle interval of its
    /// own, idle polling is never faster than normal polling.
    pub fn from_app_constants(constants: &serde_json::Value) -> Self {
        let mut config = Self::default();

        if let Some(interval) = read_millis(constants, POLLER_INTERVAL_KEY) {
            config.default_interval = interval;
            config.request_timeout = interval
                .checked_sub(Duration::from_secs(1))
                .filter(|t| !t.is_zero())
                .unwrap_or(interval);
        }
        match read_millis(constants, IDLE_POLLER_INTERVAL_KEY) {
            Some(interval) => config.idle_interval = interval,
            None => config.idle_interval = config.idle_interval.max(config.default_interval),
        }

        config
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), PollerError> {
        if self.min_interval.is_zero() {
            return Err(PollerError::Configuration(
                "Minimum interval must be greater than 0".to_string(),
            ));
        }

        if self.default_interval.is_zero() {
            return Err(PollerError::Configuration(
                "Invalid polling interval: default must be greater than 0".to_string(),
            ));
        }

        if self.idle_interval < self.default_interval {
            return Err(PollerError::Configuration(
                "Invalid idle interval: idle must not be below the default".to_string(),
            ));
        }

        if self.error_history_capacity == 0 {
            return Err(PollerError::Configuration(
                "Error history capacity must be greater than 0".to_string(),
            ));
        }

        if self.latency_sample_size == 0 {
            return Err(PollerError::Configuration(
                "Latency sample size must be greater than 0".to_string(),
            ));
        }

        if self.give_up_threshold == 0
            || self.give_up_threshold as usize > self.error_history_capacity
        {
            return Err(PollerError::Configuration(
                "Give-up threshold must be between 1 and the error history capacity".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(PollerError::Configuration(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_intervals(mut self, default: Duration, idle: Duration) -> Self {
        self.default_interval = default;
        self.idle_interval = idle;
        self
    }

    pub fn with_min_interval(mut self, min: Duration) -> Self {
        self.min_interval = min;
        self
    }

    pub fn with_give_up_threshold(mut self, threshold: u64) -> Self {
        self.give_up_threshold = threshold;
        self
    }

    pub fn with_stop_on_permanent_error(mut self, enabled: bool) -> Self {
        self.stop_on_permanent_error = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn read_millis(constants: &serde_json::Value, key: &str) -> Option<Duration> {
    let millis = match constants.get(key)? {
        serde_json::Value::Number(n) => n.as_u64()?,
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (millis > 0).then(|| Duration::from_millis(millis))
}

/// Serialize durations as whole milliseconds, the unit the console uses.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
