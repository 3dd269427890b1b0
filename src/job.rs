//! Job handles, states, and the slot record stored in the job table.
//!
//! A job is named by a `(slot index, generation)` pair. The generation is
//! bumped every time a slot is retired, so a handle kept past its job's
//! lifetime simply goes stale instead of aliasing the slot's next occupant.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Dependent indices stored inline in a slot before spilling to the heap.
pub(crate) const INLINE_DEPENDENTS: usize = 6;

/// Sentinel for "no group" / "no arena" back-references.
pub(crate) const NO_GROUP: u32 = u32::MAX;

/// Names a job in the table. The zero handle is reserved as "none"; a handle
/// whose generation no longer matches its slot is *stale* and every
/// operation on it behaves as if the job had completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    index: u32,
    generation: u32,
}

impl JobHandle {
    /// The reserved "no job" handle.
    pub const NONE: JobHandle = JobHandle {
        index: 0,
        generation: 0,
    };

    pub(crate) fn new(index: u32, generation: u32) -> JobHandle {
        JobHandle { index, generation }
    }

    pub fn is_none(&self) -> bool {
        self.index == 0
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the handle into the `u64` representation the deques carry.
    /// Slot 0 is never allocated, so no live job packs to `0`.
    pub(crate) fn pack(&self) -> u64 {
        (self.index as u64) << 32 | self.generation as u64
    }

    pub(crate) fn unpack(bits: u64) -> JobHandle {
        JobHandle {
            index: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        JobHandle::NONE
    }
}

/// Lifecycle of a job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    /// Slot is unallocated.
    Free = 0,
    /// Allocated, still collecting dependencies; not yet submitted.
    Pending = 1,
    /// Fan-in reached zero; the job sits in some queue.
    Ready = 2,
    /// Executing (or suspended mid-execution) on a worker.
    Running = 3,
    /// Body finished; dependents have been released.
    Completed = 4,
    /// Dropped before execution (submission failure) or body panicked.
    Cancelled = 5,
}

impl JobState {
    pub(crate) fn from_u8(v: u8) -> JobState {
        match v {
            0 => JobState::Free,
            1 => JobState::Pending,
            2 => JobState::Ready,
            3 => JobState::Running,
            4 => JobState::Completed,
            _ => JobState::Cancelled,
        }
    }

    /// Completed and Cancelled are both terminal for waiters.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }
}

/// Where overflow submissions are routed and which global queue the workers
/// drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Normal,
}

/// Which fiber sub-pool a job executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StackClass {
    #[default]
    Small,
    Large,
}

/// Verdict returned by a cooperative job body after each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoopStatus {
    /// Run the body again immediately.
    Continue,
    /// Re-enqueue the job and give the worker back to other work.
    Yield,
    /// The job is done.
    Complete,
}

/// Timing and placement record for a live job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobPerfInfo {
    pub created_ns: u64,
    pub started_ns: u64,
    pub completed_ns: u64,
    /// Worker that executed (or is executing) the job.
    pub worker_id: u32,
    /// Number of jobs depending on this one.
    pub dependent_count: u32,
}

pub(crate) enum JobPayload {
    /// Nothing to run; used by join/barrier jobs.
    Empty,
    Once(Box<dyn FnOnce() + Send + 'static>),
    Cooperative(Box<dyn FnMut() -> CoopStatus + Send + 'static>),
}

/// One record in the job table. The address is stable for the process
/// lifetime; reuse is mediated entirely through `state` and `generation`.
pub(crate) struct JobSlot {
    pub(crate) state: AtomicU8,
    pub(crate) generation: AtomicU32,

    /// Unmet prerequisites plus one guard released by `submit`.
    pub(crate) incoming_deps: AtomicU32,
    /// Linkers currently appending to this slot's dependent list; retirement
    /// waits for this to drain so an append never lands in a recycled slot.
    pub(crate) link_pins: AtomicU32,
    /// Total dependents appended; indexes into `dependents` then `overflow`.
    pub(crate) dependent_count: AtomicU32,
    pub(crate) dependents: [AtomicU32; INLINE_DEPENDENTS],
    pub(crate) overflow: Mutex<Vec<u32>>,

    /// Group membership, or `NO_GROUP`.
    pub(crate) group: AtomicU32,
    /// Group whose arena this job borrows, or `NO_GROUP`. Inherited by
    /// spawned children.
    pub(crate) arena_group: AtomicU32,
    /// Parent slot index for hierarchical spawn, or 0.
    pub(crate) parent: AtomicU32,

    pub(crate) priority: AtomicU8,
    pub(crate) stack_class: AtomicU8,

    pub(crate) created_ns: AtomicU64,
    pub(crate) started_ns: AtomicU64,
    pub(crate) completed_ns: AtomicU64,
    pub(crate) worker_id: AtomicU32,

    /// Written by the allocating thread while the slot is Pending, read by
    /// the executing worker; the state machine makes access exclusive.
    pub(crate) name: UnsafeCell<&'static str>,
    pub(crate) payload: UnsafeCell<JobPayload>,
}

// SAFETY: the UnsafeCell fields are written only by the thread that claimed
// the slot (state Free -> Pending) and read or replaced only by the single
// worker executing it (state Ready -> Running). The release/acquire pair on
// queue hand-off orders those accesses.
unsafe impl Sync for JobSlot {}

impl JobSlot {
    pub(crate) fn new() -> JobSlot {
        JobSlot {
            state: AtomicU8::new(JobState::Free as u8),
            generation: AtomicU32::new(0),
            incoming_deps: AtomicU32::new(0),
            link_pins: AtomicU32::new(0),
            dependent_count: AtomicU32::new(0),
            dependents: Default::default(),
            overflow: Mutex::new(Vec::new()),
            group: AtomicU32::new(NO_GROUP),
            arena_group: AtomicU32::new(NO_GROUP),
            parent: AtomicU32::new(0),
            priority: AtomicU8::new(0),
            stack_class: AtomicU8::new(0),
            created_ns: AtomicU64::new(0),
            started_ns: AtomicU64::new(0),
            completed_ns: AtomicU64::new(0),
            worker_id: AtomicU32::new(0),
            name: UnsafeCell::new(""),
            payload: UnsafeCell::new(JobPayload::Empty),
        }
    }

    pub(crate) fn priority_of(&self, order: std::sync::atomic::Ordering) -> Priority {
        if self.priority.load(order) == 0 {
            Priority::Normal
        } else {
            Priority::High
        }
    }

    pub(crate) fn stack_class_of(&self, order: std::sync::atomic::Ordering) -> StackClass {
        if self.stack_class.load(order) == 0 {
            StackClass::Small
        } else {
            StackClass::Large
        }
    }
}
