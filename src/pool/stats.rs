use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use crate::pool::metrics::PoolMetrics;

/// Monotonic pool counters, updated without taking the connection lock.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale_conns: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        PoolMetrics::record_hit();
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        PoolMetrics::record_miss();
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        PoolMetrics::record_timeout();
    }

    pub(crate) fn record_stale(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.stale_conns.fetch_add(n, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        PoolMetrics::record_stale(n);
    }

    pub(crate) fn snapshot(&self, total_conns: usize, idle_conns: usize) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_conns,
            idle_conns,
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Idle connection handed out by `get`.
    pub hits: u64,
    /// `get` found nothing idle and dialed.
    pub misses: u64,
    /// `get` gave up waiting for an admission slot.
    pub timeouts: u64,
    pub total_conns: usize,
    pub idle_conns: usize,
    /// Connections evicted for exceeding the idle or age limit.
    pub stale_conns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let counters = StatsCounters::default();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_timeout();
        counters.record_stale(3);
        counters.record_stale(0);

        let stats = counters.snapshot(5, 2);
        assert_eq!(
            stats,
            PoolStats {
                hits: 2,
                misses: 1,
                timeouts: 1,
                total_conns: 5,
                idle_conns: 2,
                stale_conns: 3,
            }
        );
    }

    #[test]
    fn stats_serialize_as_flat_json() {
        let stats = PoolStats {
            hits: 4,
            ..Default::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["hits"], 4);
        assert_eq!(json["stale_conns"], 0);
    }
}
