//! Bus configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RipleyError};

/// Default number of correlation buckets.
pub const DEFAULT_QUEUE_LEN: usize = 5;

/// Default watchdog tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Timing of the correlation ring.
///
/// A call times out between `(queue_len - 1) * tick_interval` and
/// `queue_len * tick_interval` after it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub queue_len: usize,
    pub tick_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_len: DEFAULT_QUEUE_LEN,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBusConfig {
    queue_len: Option<usize>,
    tick_interval_ms: Option<u64>,
}

impl BusConfig {
    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_len == 0 {
            return Err(RipleyError::Config("queue_len must be at least 1".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(RipleyError::Config("tick_interval must be positive".into()));
        }
        Ok(())
    }

    /// Parse from JSON such as `{"queue_len": 8, "tick_interval_ms": 250}`.
    /// Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawBusConfig = serde_json::from_str(json)?;
        let defaults = Self::default();
        let config = Self {
            queue_len: raw.queue_len.unwrap_or(defaults.queue_len),
            tick_interval: raw
                .tick_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.queue_len, 5);
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let config = BusConfig::from_json(r#"{"tick_interval_ms": 250}"#).unwrap();
        assert_eq!(config.queue_len, DEFAULT_QUEUE_LEN);
        assert_eq!(config.tick_interval, Duration::from_millis(250));

        assert_eq!(BusConfig::from_json("{}").unwrap(), BusConfig::default());
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            BusConfig::from_json(r#"{"queue_len": 0}"#),
            Err(RipleyError::Config(_))
        ));
        assert!(matches!(
            BusConfig::from_json(r#"{"queue_length": 3}"#),
            Err(RipleyError::Json(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = BusConfig::default()
            .with_queue_len(2)
            .with_tick_interval(Duration::from_millis(10));
        assert_eq!(config.queue_len, 2);
        assert_eq!(config.tick_interval, Duration::from_millis(10));
    }
}
