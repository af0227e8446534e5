//! Atomic probe statistics counters.
//!
//! `Relaxed` ordering throughout: these are report counters read once the
//! run is idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

struct StatsInner {
    requests: AtomicU64,
    failures: AtomicU64,
    body_bytes: AtomicU64,
}

/// Thread-safe atomic probe statistics. Cheap to clone (Arc).
#[derive(Clone)]
pub struct ProbeStats {
    inner: Arc<StatsInner>,
}

/// Snapshot of current stats values, serializable to JSON.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub body_bytes: u64,
}

impl ProbeStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                requests: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                body_bytes: AtomicU64::new(0),
            }),
        }
    }

    pub fn inc_requests(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_body_bytes(&self, n: u64) {
        self.inner.body_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.inner.requests.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            body_bytes: self.inner.body_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let stats = ProbeStats::new();
        let other = stats.clone();
        stats.inc_requests();
        other.inc_requests();
        other.inc_failures();
        stats.add_body_bytes(42);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                requests: 2,
                failures: 1,
                body_bytes: 42,
            }
        );
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["body_bytes"], 42);
    }
}
