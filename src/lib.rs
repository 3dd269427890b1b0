//! # fiberloom — fiber-based work-stealing job scheduler
//!
//! A game-engine runtime core: short-lived jobs submitted from any thread
//! are distributed across a fixed pool of pinned workers, ordered by
//! DAG-style dependencies, and executed on stackful fibers so a job that
//! waits on another never blocks its worker. Victim selection for work
//! stealing is NUMA-aware, keeping steals cache-local on multi-socket
//! hardware.
//!
//! ## Architecture
//!
//! - A generation-tagged **job table** makes handles safe across slot
//!   reuse: operations on a stale handle are no-ops that read as completed.
//! - Each worker owns a lock-free **Chase–Lev deque**; idle workers steal
//!   from the top, preferring victims on their own NUMA node.
//! - Jobs run on pooled **fibers**; `yield_now` and in-job `wait` park the
//!   fiber and hand the worker to other work.
//! - **Groups** are barriers over job sets, with an optional continuation
//!   and an owned scratch arena.
//!
//! ## Example
//!
//! ```no_run
//! use fiberloom::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
//!
//! let root = scheduler.schedule("produce", || {
//!     // fill some buffer
//! }).unwrap();
//! let consume = scheduler.schedule_after("consume", root, || {
//!     // runs only after `produce` completed
//! }).unwrap();
//!
//! scheduler.wait(consume);
//! scheduler.shutdown();
//! ```

pub mod arena;
pub mod deque;
pub mod error;
pub mod group;
pub mod job;
pub mod profiler;
pub mod scheduler;
pub mod stats;
pub mod topology;

mod fiber;
mod fiber_pool;
mod job_table;
mod worker;

pub use arena::Arena;
pub use error::{ScheduleError, SchedulerError};
pub use group::GroupHandle;
pub use job::{CoopStatus, JobHandle, JobPerfInfo, JobState, Priority, StackClass};
pub use profiler::{FrameProfile, JobTrace};
pub use scheduler::{yield_now, GroupInfo, JobOptions, Scheduler, SchedulerConfig};
pub use stats::{PoolStats, WorkerStats};
pub use topology::{Topology, TopologyNode};
