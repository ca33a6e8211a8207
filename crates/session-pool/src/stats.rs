//! Pool statistics and metrics snapshots.

use std::time::Duration;

/// Point-in-time view of the pool's collections.
///
/// Taken under a shared lock; not transactionally consistent with
/// concurrent acquires and releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStats {
    /// Idle plus active sessions.
    pub total: u32,
    /// Sessions checked out by callers.
    pub active: u32,
    /// Sessions in the idle collection, including ones being probed.
    pub idle: u32,
    /// Successful heartbeat probes since the last counter reset.
    pub heartbeats: u64,
    /// Maximum allowed sessions at the time of the snapshot.
    pub max: u32,
}

impl PoolStats {
    /// Percentage of the maximum currently checked out.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.active as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
pub(crate) struct PoolMetricsInner {
    pub(crate) connections_created: u64,
    pub(crate) connections_closed: u64,
    pub(crate) checkouts_successful: u64,
    pub(crate) checkouts_failed: u64,
    pub(crate) heartbeats_performed: u64,
    pub(crate) heartbeats_failed: u64,
    pub(crate) evictions: u64,
}

/// Cumulative counters collected since the pool was created.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Sessions created by the factory.
    pub connections_created: u64,
    /// Sessions closed or discarded by the pool.
    pub connections_closed: u64,
    /// Successful checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (timeouts, factory errors, pool closed).
    pub checkouts_failed: u64,
    /// Heartbeat probes run.
    pub heartbeats_performed: u64,
    /// Heartbeat probes that failed.
    pub heartbeats_failed: u64,
    /// Sessions removed because they were dead on release or failed a probe.
    pub evictions: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    pub(crate) fn from_inner(inner: &PoolMetricsInner, uptime: Duration) -> Self {
        Self {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            heartbeats_performed: inner.heartbeats_performed,
            heartbeats_failed: inner.heartbeats_failed,
            evictions: inner.evictions,
            uptime,
        }
    }

    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate heartbeat success rate (0.0 to 1.0).
    #[must_use]
    pub fn heartbeat_success_rate(&self) -> f64 {
        if self.heartbeats_performed == 0 {
            return 1.0;
        }
        let successful = self.heartbeats_performed - self.heartbeats_failed;
        successful as f64 / self.heartbeats_performed as f64
    }
}
