//! Transport configuration.

use std::time::Duration;

/// Tuning for [`EventTransport`](crate::EventTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Fixed interval between reconnect attempts.
    pub retry_interval: Duration,
    /// Minimum gap between two logged transport errors.
    pub error_debounce: Duration,
    /// Capacity of the inbound event broadcast channel.
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(30),
            error_debounce: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_error_debounce(mut self, debounce: Duration) -> Self {
        self.error_debounce = debounce;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.error_debounce, Duration::from_secs(1));
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(TransportConfig::new().with_event_capacity(0).event_capacity, 1);
    }
}
