//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a session pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on idle plus active sessions (default: 10).
    pub max_connections: u32,

    /// Maximum time `acquire()` waits for a session (default: 30 seconds).
    pub acquire_timeout: Duration,

    /// Minimum idle time before a session is probed. Zero disables heartbeats.
    pub heartbeat_interval: Duration,

    /// Statement used to probe idle sessions (default: `SELECT 1`).
    pub heartbeat_query: String,

    /// Nominal sleep between heartbeat cycles (default: 500 ms).
    pub heartbeat_tick: Duration,

    /// Sleep after a cycle skipped because the pool was busy (default: 100 ms).
    pub heartbeat_busy_tick: Duration,

    /// Poll interval while shutdown waits for borrowed sessions (default: 10 ms).
    pub shutdown_poll_interval: Duration,

    /// Give up waiting for borrowed sessions after this long. `None` waits forever.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::ZERO,
            heartbeat_query: "SELECT 1".to_string(),
            heartbeat_tick: Duration::from_millis(500),
            heartbeat_busy_tick: Duration::from_millis(100),
            shutdown_poll_interval: Duration::from_millis(10),
            shutdown_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the heartbeat interval. `Duration::ZERO` disables heartbeats.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat probe statement.
    #[must_use]
    pub fn heartbeat_query(mut self, query: impl Into<String>) -> Self {
        self.heartbeat_query = query.into();
        self
    }

    /// Set the nominal and busy sleeps of the heartbeat loop.
    #[must_use]
    pub fn heartbeat_ticks(mut self, nominal: Duration, busy: Duration) -> Self {
        self.heartbeat_tick = nominal;
        self.heartbeat_busy_tick = busy;
        self
    }

    /// Set the poll interval used while shutting down.
    #[must_use]
    pub fn shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = interval;
        self
    }

    /// Bound how long shutdown waits for borrowed sessions.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Whether heartbeats are enabled.
    #[must_use]
    pub fn heartbeats_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.heartbeat_query.trim().is_empty() {
            return Err(PoolError::Config("heartbeat_query cannot be empty".into()));
        }

        if self.heartbeat_tick.is_zero() || self.heartbeat_busy_tick.is_zero() {
            return Err(PoolError::Config("heartbeat ticks must be non-zero".into()));
        }

        if self.shutdown_poll_interval.is_zero() {
            return Err(PoolError::Config(
                "shutdown_poll_interval must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert!(!config.heartbeats_enabled());
        assert_eq!(config.heartbeat_query, "SELECT 1");
        assert!(config.shutdown_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_millis(250))
            .heartbeat_interval(Duration::from_secs(1))
            .heartbeat_query("SELECT 42")
            .heartbeat_ticks(Duration::from_millis(50), Duration::from_millis(10))
            .shutdown_timeout(Duration::from_secs(2));

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert!(config.heartbeats_enabled());
        assert_eq!(config.heartbeat_query, "SELECT 42");
        assert_eq!(config.heartbeat_tick, Duration::from_millis(50));
        assert_eq!(config.heartbeat_busy_tick, Duration::from_millis(10));
        assert_eq!(config.shutdown_timeout, Some(Duration::from_secs(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
        assert!(PoolConfig::new().heartbeat_query("  ").validate().is_err());
        assert!(
            PoolConfig::new()
                .heartbeat_ticks(Duration::ZERO, Duration::from_millis(10))
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new()
                .shutdown_poll_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
