use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifetime counters, updated under the pool lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    /// Dials started.
    pub dials: u64,
    pub dial_failures: u64,
    /// Idle connections handed back out.
    pub reuses: u64,
    /// Released connections passed straight to a queued request.
    pub handoffs: u64,
    pub idle_parked: u64,
    /// Connections closed by the pool, for any reason.
    pub closed: u64,
    pub timeouts: u64,
    pub idle_faults: u64,
    pub detached: u64,
}

/// Occupancy of a single bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub key: String,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub connecting: usize,
}

/// Point-in-time snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub captured_at: DateTime<Utc>,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub connecting: usize,
    /// Sorted by key.
    pub buckets: Vec<BucketStats>,
    pub counters: PoolCounters,
}

impl PoolStats {
    pub fn bucket(&self, key: &str) -> Option<&BucketStats> {
        self.buckets.iter().find(|bucket| bucket.key == key)
    }

    /// True when nothing is tracked at all.
    pub fn is_empty(&self) -> bool {
        self.active == 0 && self.idle == 0 && self.pending == 0 && self.connecting == 0
    }
}
