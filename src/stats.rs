//! Pool-wide and per-worker counters with snapshot views.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared by the whole pool.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) tasks_submitted: AtomicU64,
    pub(crate) tasks_completed: AtomicU64,
    pub(crate) tasks_cancelled: AtomicU64,
    pub(crate) global_pushes: AtomicU64,
    pub(crate) wakeups: AtomicU64,
}

/// Counters owned by one worker; padded out in the scheduler so neighbors
/// do not false-share.
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    pub(crate) tasks_executed: AtomicU64,
    pub(crate) local_pushes: AtomicU64,
    pub(crate) local_pops: AtomicU64,
    pub(crate) steals_attempted: AtomicU64,
    pub(crate) steals_succeeded: AtomicU64,
    pub(crate) yields: AtomicU64,
    pub(crate) sleeps: AtomicU64,
}

/// Snapshot of one worker's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: u32,
    pub node: u32,
    pub tasks_executed: u64,
    pub local_pushes: u64,
    pub local_pops: u64,
    pub steals_attempted: u64,
    pub steals_succeeded: u64,
    pub yields: u64,
    pub sleeps: u64,
}

impl WorkerStats {
    pub fn steal_success_rate(&self) -> f64 {
        if self.steals_attempted == 0 {
            0.0
        } else {
            self.steals_succeeded as f64 / self.steals_attempted as f64
        }
    }
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub worker_count: u32,
    pub sleeping_workers: u32,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_cancelled: u64,
    pub global_pushes: u64,
    pub wakeups: u64,
    pub global_queue_len: usize,
    pub high_priority_queue_len: usize,
    pub workers: Vec<WorkerStats>,
}

impl PoolStats {
    /// Jobs accepted but not yet finished (completed or cancelled).
    pub fn tasks_in_flight(&self) -> u64 {
        self.tasks_submitted
            .saturating_sub(self.tasks_completed + self.tasks_cancelled)
    }

    pub fn total_steals_succeeded(&self) -> u64 {
        self.workers.iter().map(|w| w.steals_succeeded).sum()
    }
}

impl WorkerCounters {
    pub(crate) fn snapshot(&self, worker_id: u32, node: u32) -> WorkerStats {
        WorkerStats {
            worker_id,
            node,
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            local_pops: self.local_pops.load(Ordering::Relaxed),
            steals_attempted: self.steals_attempted.load(Ordering::Relaxed),
            steals_succeeded: self.steals_succeeded.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
        }
    }
}
