//! Error types for scheduler initialization and job submission.

use thiserror::Error;

/// Failure to accept a job into the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Every slot in the job table is live. The caller decides whether to
    /// retry, run inline, or drop the work.
    #[error("job table exhausted")]
    TableExhausted,

    /// The local deque and the matching global queue are both full.
    #[error("scheduler queues are full")]
    QueueFull,

    /// The scheduler has begun shutting down and accepts no new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Failure to bring the scheduler up.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A worker thread could not be spawned. The partially initialized pool
    /// is torn down before this is returned.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
