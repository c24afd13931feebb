//! Pool sizing policies

use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of the pool taken under the overseer lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub spawning: usize,
    pub attached: usize,
    pub draining: usize,
    /// Attached drones serving at least one request
    pub busy: usize,
    /// Requests waiting for a drone
    pub pending: usize,
    /// Pending requests a fresh drone could serve that no spawning drone
    /// has been assigned to yet
    pub unassigned: usize,
}

impl PoolStats {
    /// Entries that are not on their way out
    pub fn live(&self) -> usize {
        self.spawning + self.attached
    }

    pub fn total(&self) -> usize {
        self.live() + self.draining
    }
}

/// Decides how many live drones the pool should have
pub trait Balancer: Send + Sync {
    fn target(&self, stats: &PoolStats) -> usize;

    /// Called when the pool is explicitly sized to `size` live drones
    fn resize(&self, _size: usize) {}
}

/// Keeps at least `pool_size` live drones, respawning after deaths. Never
/// shrinks the pool; an explicit `rebalance_to` moves the floor.
#[derive(Debug, Default)]
pub struct StaticBalancer {
    pool_size: AtomicUsize,
}

impl StaticBalancer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: AtomicUsize::new(pool_size),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }
}

impl Balancer for StaticBalancer {
    fn target(&self, stats: &PoolStats) -> usize {
        stats.live().max(self.pool_size())
    }

    fn resize(&self, size: usize) {
        self.pool_size.store(size, Ordering::Relaxed);
    }
}

/// Spawns one drone per request nobody is on the way to serve, up to
/// `pool_limit`. Never shrinks the pool.
#[derive(Debug, Clone, Copy)]
pub struct QueueBalancer {
    pool_limit: usize,
}

impl QueueBalancer {
    pub fn new(pool_limit: usize) -> Self {
        Self { pool_limit }
    }
}

impl Balancer for QueueBalancer {
    fn target(&self, stats: &PoolStats) -> usize {
        let wanted = (stats.live() + stats.unassigned).min(self.pool_limit);
        wanted.max(stats.live())
    }
}
