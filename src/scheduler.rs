//! The scheduler value: worker pool lifecycle and the public job API.
//!
//! Everything the C-style original kept in globals lives here in one
//! `Shared` block behind an `Arc`; a thread-local pointer locates the
//! current worker so jobs can submit to their own deque without threading
//! the scheduler through every call. The thread that calls
//! [`Scheduler::new`] is promoted to worker 0 and demoted at shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_utils::{Backoff, CachePadded};
use serde::{Deserialize, Serialize};

use crate::deque::{InjectorQueue, Stealer, WorkerQueue};
use crate::error::{ScheduleError, SchedulerError};
use crate::group::{GroupHandle, GroupTable};
use crate::job::{
    CoopStatus, JobHandle, JobPayload, JobPerfInfo, JobState, Priority, StackClass,
    INLINE_DEPENDENTS, NO_GROUP,
};
use crate::job_table::JobTable;
use crate::profiler::{FrameProfile, JobTrace, Profiler};
use crate::stats::{PoolCounters, PoolStats, WorkerCounters};
use crate::topology::Topology;
use crate::worker::{self, WorkerCtx};

/// Tuning knobs for the pool. The defaults match a desktop game runtime;
/// embedders usually only override `worker_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads to spawn in addition to the promoted caller.
    /// `None` means `logical_cpus - 1`.
    pub worker_count: Option<usize>,
    /// Slots in the job table.
    pub job_capacity: usize,
    /// Slots in the group table.
    pub group_capacity: usize,
    /// Capacity of each worker's deque.
    pub local_queue_capacity: usize,
    /// Capacity of the normal-priority global queue.
    pub global_queue_capacity: usize,
    /// Capacity of the high-priority global queue.
    pub high_priority_queue_capacity: usize,
    /// Pause iterations before an idle worker blocks.
    pub max_idle_spins: u32,
    /// Steal attempts per round before falling through to the global
    /// queues.
    pub steal_attempts_per_round: u32,
    /// Pin workers to their node's cores.
    pub pin_workers: bool,
    /// Detect NUMA nodes; off forces the single synthetic node.
    pub numa_aware: bool,
    /// Entries in the profiler frame ring.
    pub profiler_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            worker_count: None,
            job_capacity: 4096,
            group_capacity: 256,
            local_queue_capacity: 256,
            global_queue_capacity: 1024,
            high_priority_queue_capacity: 512,
            max_idle_spins: 1000,
            steal_attempts_per_round: 4,
            pin_workers: true,
            numa_aware: true,
            profiler_capacity: 4096,
        }
    }
}

/// Per-job options for [`Scheduler::schedule_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    pub priority: Priority,
    pub stack: StackClass,
    /// Prerequisite; the job starts only after it completes.
    pub after: JobHandle,
}

/// Snapshot of a group's progress.
#[derive(Debug, Clone, Copy)]
pub struct GroupInfo {
    /// Members not yet completed.
    pub remaining: u32,
    /// Members ever added.
    pub total: u32,
    pub created_ns: u64,
}

/// Process-wide state shared between the API surface and the workers.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) jobs: JobTable,
    pub(crate) groups: GroupTable,
    pub(crate) global_queue: InjectorQueue,
    pub(crate) high_queue: InjectorQueue,
    pub(crate) stealers: Vec<Stealer>,
    pub(crate) topology: Topology,
    pub(crate) sleep_mutex: Mutex<()>,
    pub(crate) wake_cond: Condvar,
    pub(crate) sleeping: AtomicU32,
    pub(crate) shutdown: AtomicBool,
    pub(crate) pool_counters: PoolCounters,
    pub(crate) worker_counters: Vec<CachePadded<WorkerCounters>>,
    pub(crate) profiler: Profiler,
    epoch: Instant,
    owners: AtomicU32,
    join_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl Shared {
    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.stealers.len()
    }

    /// Wakes sleeping workers if there are any. Held for O(1): the mutex
    /// only serializes against the sleep predicate check.
    pub(crate) fn wake_workers(&self) {
        if self.sleeping.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.sleep_mutex.lock().unwrap();
        self.pool_counters.wakeups.fetch_add(1, Ordering::Relaxed);
        self.wake_cond.notify_all();
    }

    /// Routes a Ready job: caller's deque first, then the global queue for
    /// its priority. Fails only when both are full.
    pub(crate) fn enqueue_ready(&self, bits: u64, priority: Priority) -> Result<(), ScheduleError> {
        let pushed_local = worker::with_current(|ctx| match ctx {
            // A worker of a *different* scheduler must not receive our jobs.
            Some(ctx) if std::ptr::eq(Arc::as_ptr(&ctx.shared), self) => {
                match ctx.queue.push_bottom(bits) {
                    Ok(()) => {
                        self.worker_counters[ctx.id as usize]
                            .local_pushes
                            .fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        });
        if pushed_local {
            self.wake_workers();
            return Ok(());
        }

        let queue = match priority {
            Priority::High => &self.high_queue,
            Priority::Normal => &self.global_queue,
        };
        match queue.push(bits) {
            Ok(()) => {
                self.pool_counters
                    .global_pushes
                    .fetch_add(1, Ordering::Relaxed);
                self.wake_workers();
                Ok(())
            }
            Err(_) => Err(ScheduleError::QueueFull),
        }
    }

    /// Enqueue that must not lose the job (dependency releases, yields).
    /// Retries with backoff until some queue accepts it.
    pub(crate) fn enqueue_ready_infallible(&self, bits: u64, priority: Priority) {
        let backoff = Backoff::new();
        loop {
            if self.enqueue_ready(bits, priority).is_ok() {
                return;
            }
            backoff.snooze();
        }
    }

    /// Decrements a dependent's fan-in; at zero the job becomes Ready and
    /// is queued. Shared by prerequisite completion and by `submit`'s
    /// closing decrement compensation.
    pub(crate) fn release_dependent(&self, index: u32) {
        let slot = self.jobs.slot(index);
        let before = slot.incoming_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "fan-in underflow");
        if before == 1 {
            slot.state.store(JobState::Ready as u8, Ordering::Release);
            let bits = self.jobs.handle_for(index).pack();
            self.enqueue_ready_infallible(bits, slot.priority_of(Ordering::Relaxed));
        }
    }

    /// Completion path: publish the terminal state, release dependents,
    /// close out the group, retire the slot.
    pub(crate) fn finish_job(&self, index: u32, cancelled: bool) {
        let slot = self.jobs.slot(index);
        let now = self.now_ns();
        slot.completed_ns.store(now, Ordering::Relaxed);
        let terminal = if cancelled {
            JobState::Cancelled
        } else {
            JobState::Completed
        };
        // SeqCst pairs with the linker's post-append state check; see
        // JobTable::consume_dependent.
        slot.state.store(terminal as u8, Ordering::SeqCst);

        if !cancelled {
            // SAFETY: name is immutable while the slot is live past Pending.
            let name = unsafe { *slot.name.get() };
            self.profiler.record(JobTrace {
                start_ns: slot.started_ns.load(Ordering::Relaxed),
                end_ns: now,
                worker_id: slot.worker_id.load(Ordering::Relaxed),
                name,
            });
        }

        let dependents = slot.dependent_count.load(Ordering::SeqCst);
        for position in 0..dependents {
            if let Some(dep) = self.jobs.consume_dependent(slot, position) {
                self.release_dependent(dep);
            }
        }

        let group = slot.group.load(Ordering::Acquire);
        if group != NO_GROUP {
            if let Some(continuation) = self.groups.finish_member(group) {
                if self.submit_existing(continuation).is_err() {
                    log::warn!("group continuation could not be queued");
                }
            }
        }

        if cancelled {
            self.pool_counters
                .tasks_cancelled
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool_counters
                .tasks_completed
                .fetch_add(1, Ordering::Relaxed);
        }
        self.jobs.retire(index);
    }

    /// Cooperative yield: the body asked to be re-run later. State goes
    /// back to Ready and the handle re-enters a queue.
    pub(crate) fn requeue_yielded(&self, index: u32) {
        let slot = self.jobs.slot(index);
        let worker_id = slot.worker_id.load(Ordering::Relaxed) as usize;
        if worker_id < self.worker_counters.len() {
            self.worker_counters[worker_id]
                .yields
                .fetch_add(1, Ordering::Relaxed);
        }
        slot.state.store(JobState::Ready as u8, Ordering::Release);
        let bits = self.jobs.handle_for(index).pack();
        self.enqueue_ready_infallible(bits, slot.priority_of(Ordering::Relaxed));
    }

    /// Final decrement for a created job; enqueues it when the fan-in hits
    /// zero. Stale handles are treated as already completed.
    pub(crate) fn submit_existing(&self, handle: JobHandle) -> Result<(), ScheduleError> {
        let Some(slot) = self.jobs.get(handle) else {
            return Ok(());
        };
        debug_assert_eq!(
            JobState::from_u8(slot.state.load(Ordering::Acquire)),
            JobState::Pending,
            "submitting a job twice"
        );
        let before = slot.incoming_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "fan-in underflow on submit");
        if before == 1 {
            slot.state.store(JobState::Ready as u8, Ordering::Release);
            let priority = slot.priority_of(Ordering::Relaxed);
            let mut queued = self.enqueue_ready(handle.pack(), priority).is_ok();
            // Queues full: a worker can make its own space by draining a
            // job per attempt. Each help retires one job, so this loop is
            // bounded by the work outstanding.
            while !queued && worker::help_once() {
                queued = self.enqueue_ready(handle.pack(), priority).is_ok();
            }
            if !queued {
                // Nowhere to put it: cancel so waiters and dependents are
                // not wedged, and report the failure.
                slot.state.store(JobState::Cancelled as u8, Ordering::SeqCst);
                self.finish_job(handle.index(), true);
                return Err(ScheduleError::QueueFull);
            }
        }
        Ok(())
    }

}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Handle to the scheduler. Cheap to clone; the pool shuts down when the
/// last clone is dropped (or explicitly via [`shutdown`](Scheduler::shutdown)).
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Brings up the pool: detects topology, spawns pinned workers, and
    /// promotes the calling thread to worker 0. On any platform failure the
    /// partially initialized pool is torn down before the error returns.
    pub fn new(config: SchedulerConfig) -> Result<Scheduler, SchedulerError> {
        if config.job_capacity < 2 {
            return Err(SchedulerError::InvalidConfig("job_capacity must be >= 2"));
        }
        if config.max_idle_spins == 0 {
            return Err(SchedulerError::InvalidConfig("max_idle_spins must be > 0"));
        }

        let worker_threads = config.worker_count.unwrap_or_else(default_worker_threads);
        let total_workers = worker_threads + 1;
        let topology = Topology::detect(total_workers, config.numa_aware);
        log::info!(
            "fiberloom: {} workers across {} node(s)",
            total_workers,
            topology.nodes().len()
        );

        let mut queues = Vec::with_capacity(total_workers);
        let mut stealers = Vec::with_capacity(total_workers);
        for _ in 0..total_workers {
            let (queue, stealer) = WorkerQueue::new(config.local_queue_capacity);
            queues.push(queue);
            stealers.push(stealer);
        }

        let shared = Arc::new(Shared {
            jobs: JobTable::new(config.job_capacity),
            groups: GroupTable::new(config.group_capacity),
            global_queue: InjectorQueue::new(config.global_queue_capacity),
            high_queue: InjectorQueue::new(config.high_priority_queue_capacity),
            stealers,
            topology,
            sleep_mutex: Mutex::new(()),
            wake_cond: Condvar::new(),
            sleeping: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            pool_counters: PoolCounters::default(),
            worker_counters: (0..total_workers)
                .map(|_| CachePadded::new(WorkerCounters::default()))
                .collect(),
            profiler: Profiler::new(config.profiler_capacity),
            epoch: Instant::now(),
            owners: AtomicU32::new(1),
            join_handles: Mutex::new(Vec::with_capacity(worker_threads)),
            terminated: AtomicBool::new(false),
            config,
        });

        let mut queues = queues.into_iter();
        let main_queue = queues.next().expect("worker 0 queue");

        for (id, queue) in (1u32..).zip(queues) {
            let shared_clone = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("fiberloom-worker-{id}"))
                .spawn(move || worker::worker_main(id, queue, shared_clone));
            match spawned {
                Ok(handle) => shared.join_handles.lock().unwrap().push(handle),
                Err(err) => {
                    // Tear down everything spawned so far.
                    shared.shutdown.store(true, Ordering::SeqCst);
                    shared.wake_workers();
                    for handle in shared.join_handles.lock().unwrap().drain(..) {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::ThreadSpawn(err));
                }
            }
        }

        // Promote the caller to worker 0.
        worker::install_main(Box::new(WorkerCtx::new(0, main_queue, Arc::clone(&shared))));

        Ok(Scheduler { shared })
    }

    /// Convenience constructor with default configuration.
    pub fn with_default_config() -> Result<Scheduler, SchedulerError> {
        Scheduler::new(SchedulerConfig::default())
    }

    // ---- job creation -------------------------------------------------

    fn create_internal(
        &self,
        name: &'static str,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<JobHandle, ScheduleError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ScheduleError::ShuttingDown);
        }
        let index = self
            .shared
            .jobs
            .allocate()
            .ok_or(ScheduleError::TableExhausted)?;
        let slot = self.shared.jobs.slot(index);
        // SAFETY: the slot was just claimed; no one else touches the cells
        // until the job is queued.
        unsafe {
            *slot.name.get() = name;
            *slot.payload.get() = payload;
        }
        slot.priority
            .store((options.priority == Priority::High) as u8, Ordering::Relaxed);
        slot.stack_class
            .store((options.stack == StackClass::Large) as u8, Ordering::Relaxed);
        slot.created_ns.store(self.shared.now_ns(), Ordering::Relaxed);
        self.shared
            .pool_counters
            .tasks_submitted
            .fetch_add(1, Ordering::Relaxed);

        let handle = self.shared.jobs.handle_for(index);
        if !options.after.is_none() {
            self.add_dependency(handle, options.after);
        }
        Ok(handle)
    }

    /// Allocates a job without queueing it. Pair with
    /// [`submit`](Scheduler::submit) after linking dependencies or adding
    /// it to a group.
    pub fn create<F>(&self, name: &'static str, body: F) -> Result<JobHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.create_internal(name, JobPayload::Once(Box::new(body)), JobOptions::default())
    }

    /// [`create`](Scheduler::create) with explicit options.
    pub fn create_with<F>(
        &self,
        name: &'static str,
        options: JobOptions,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.create_internal(name, JobPayload::Once(Box::new(body)), options)
    }

    /// Creates a cooperative job: the body runs repeatedly until it returns
    /// [`CoopStatus::Complete`]; returning [`CoopStatus::Yield`] re-queues
    /// it and lets other jobs run in between.
    pub fn create_cooperative<F>(
        &self,
        name: &'static str,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: FnMut() -> CoopStatus + Send + 'static,
    {
        self.create_internal(
            name,
            JobPayload::Cooperative(Box::new(body)),
            JobOptions::default(),
        )
    }

    /// Performs the closing fan-in decrement; the job is queued once every
    /// linked prerequisite (and this call) has released it.
    pub fn submit(&self, handle: JobHandle) -> Result<(), ScheduleError> {
        self.shared.submit_existing(handle)
    }

    /// Creates and immediately submits a job.
    pub fn schedule<F>(&self, name: &'static str, body: F) -> Result<JobHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.create(name, body)?;
        self.submit(handle)?;
        Ok(handle)
    }

    /// Creates a job that runs after `after` completes, and submits it.
    /// A stale or none `after` counts as already satisfied.
    pub fn schedule_after<F>(
        &self,
        name: &'static str,
        after: JobHandle,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.create_internal(
            name,
            JobPayload::Once(Box::new(body)),
            JobOptions {
                after,
                ..JobOptions::default()
            },
        )?;
        self.submit(handle)?;
        Ok(handle)
    }

    /// Creates and submits with explicit options.
    pub fn schedule_with<F>(
        &self,
        name: &'static str,
        options: JobOptions,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.create_internal(name, JobPayload::Once(Box::new(body)), options)?;
        self.submit(handle)?;
        Ok(handle)
    }

    /// Creates and submits a cooperative job.
    pub fn schedule_cooperative<F>(
        &self,
        name: &'static str,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: FnMut() -> CoopStatus + Send + 'static,
    {
        let handle = self.create_cooperative(name, body)?;
        self.submit(handle)?;
        Ok(handle)
    }

    /// Submits a batch, queueing only the jobs whose fan-in is already met;
    /// the rest are released by their prerequisites. The first queue
    /// failure aborts and is returned.
    pub fn submit_batch(&self, handles: &[JobHandle]) -> Result<(), ScheduleError> {
        for &handle in handles {
            self.submit(handle)?;
        }
        Ok(())
    }

    /// Declares that `dependent` must not start before `prerequisite`
    /// completes. Valid while `dependent` is un-submitted; a terminal or
    /// stale prerequisite counts as satisfied.
    pub fn add_dependency(&self, dependent: JobHandle, prerequisite: JobHandle) {
        let shared = &*self.shared;
        let Some(dep_slot) = shared.jobs.get(dependent) else {
            return;
        };
        debug_assert_eq!(
            JobState::from_u8(dep_slot.state.load(Ordering::Acquire)),
            JobState::Pending,
            "dependencies must be added before submit"
        );
        let Some(pre_slot) = shared.jobs.get(prerequisite) else {
            return;
        };

        // Pin the prerequisite so it cannot be retired (and its slot
        // recycled) while the edge is being appended.
        pre_slot.link_pins.fetch_add(1, Ordering::SeqCst);
        if shared
            .jobs
            .get(prerequisite)
            .map(|slot| JobState::from_u8(slot.state.load(Ordering::SeqCst)))
            .map_or(true, |state| {
                state.is_terminal() || state == JobState::Free
            })
        {
            pre_slot.link_pins.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        dep_slot.incoming_deps.fetch_add(1, Ordering::SeqCst);
        let position = shared.jobs.append_dependent(pre_slot, dependent.index());

        // The prerequisite may have completed between the check and the
        // append; if its completion walk missed our entry, undo the edge
        // ourselves. The entry swap guarantees exactly one side wins.
        let state_after = JobState::from_u8(pre_slot.state.load(Ordering::SeqCst));
        if state_after.is_terminal() {
            let consumed_by_us = if (position as usize) < INLINE_DEPENDENTS {
                shared.jobs.consume_dependent(pre_slot, position).is_some()
            } else {
                shared
                    .jobs
                    .unlink_overflow_dependent(pre_slot, dependent.index())
            };
            if consumed_by_us {
                shared.release_dependent(dependent.index());
            }
        }
        pre_slot.link_pins.fetch_sub(1, Ordering::SeqCst);
    }

    /// Creates a child that starts after `parent` completes, inheriting the
    /// parent's arena when it has one, and submits it.
    pub fn spawn_child<F>(
        &self,
        parent: JobHandle,
        name: &'static str,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let child = self.create(name, body)?;
        if let (Some(child_slot), Some(parent_slot)) =
            (self.shared.jobs.get(child), self.shared.jobs.get(parent))
        {
            child_slot
                .parent
                .store(parent.index(), Ordering::Relaxed);
            let parent_arena = parent_slot.arena_group.load(Ordering::Acquire);
            if parent_arena != NO_GROUP {
                child_slot.arena_group.store(parent_arena, Ordering::Release);
            }
        }
        self.add_dependency(child, parent);
        self.submit(child)?;
        Ok(child)
    }

    /// Splits `[0, count)` into windows of `batch_size` chunk jobs plus a
    /// join job depending on all of them; returns the join handle.
    pub fn parallel_for<F>(
        &self,
        name: &'static str,
        count: u32,
        batch_size: u32,
        body: F,
    ) -> Result<JobHandle, ScheduleError>
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        let batch_size = batch_size.max(1);
        let join = self.create_internal(name, JobPayload::Empty, JobOptions::default())?;
        let body = Arc::new(body);
        let mut start = 0;
        while start < count {
            let end = (start + batch_size).min(count);
            let chunk_body = Arc::clone(&body);
            let chunk = self.create(name, move || chunk_body(start, end))?;
            self.add_dependency(join, chunk);
            self.submit(chunk)?;
            start = end;
        }
        self.submit(join)?;
        Ok(join)
    }

    // ---- waiting ------------------------------------------------------

    /// True once the handle's job completed (or was cancelled, or the
    /// handle is stale/none).
    pub fn is_complete(&self, handle: JobHandle) -> bool {
        self.shared.jobs.state_of(handle).is_terminal()
    }

    /// Blocks until the job completes. On a worker this *helps*: it keeps
    /// executing other jobs, and inside a job body it parks the fiber
    /// between attempts so the underlying thread is never blocked.
    pub fn wait(&self, handle: JobHandle) {
        let backoff = Backoff::new();
        while !self.is_complete(handle) {
            if worker::help_once() {
                continue;
            }
            if !crate::fiber::yield_parked() {
                if backoff.is_completed() {
                    std::thread::yield_now();
                } else {
                    backoff.snooze();
                }
            }
        }
    }

    /// Waits for every handle in the slice.
    pub fn wait_all(&self, handles: &[JobHandle]) {
        let backoff = Backoff::new();
        loop {
            let pending = handles.iter().any(|&h| !self.is_complete(h));
            if !pending {
                return;
            }
            if worker::help_once() {
                continue;
            }
            if !crate::fiber::yield_parked() {
                if backoff.is_completed() {
                    std::thread::yield_now();
                } else {
                    backoff.snooze();
                }
            }
        }
    }

    // ---- groups -------------------------------------------------------

    /// Creates a group sized for roughly `member_hint` jobs.
    pub fn group_create(&self, member_hint: usize) -> Option<GroupHandle> {
        self.shared.groups.create(member_hint, self.shared.now_ns())
    }

    /// Adds an un-submitted job to the group. The job borrows the group's
    /// arena. Returns false when either handle is stale.
    pub fn group_add(&self, group: GroupHandle, job: JobHandle) -> bool {
        let Some(group_slot) = self.shared.groups.get(group) else {
            return false;
        };
        let Some(job_slot) = self.shared.jobs.get(job) else {
            return false;
        };
        debug_assert_eq!(
            JobState::from_u8(job_slot.state.load(Ordering::Acquire)),
            JobState::Pending,
            "group members must be added before submit"
        );
        job_slot.group.store(group.index(), Ordering::Release);
        job_slot.arena_group.store(group.index(), Ordering::Release);
        group_slot.remaining.fetch_add(1, Ordering::AcqRel);
        group_slot.total.fetch_add(1, Ordering::Relaxed);
        group_slot.members.lock().unwrap().push(job.pack());
        true
    }

    /// Submits every member added so far; only those with met fan-in are
    /// queued immediately.
    pub fn group_submit(&self, group: GroupHandle) -> Result<(), ScheduleError> {
        let members: Vec<u64> = match self.shared.groups.get(group) {
            Some(slot) => slot.members.lock().unwrap().clone(),
            None => return Ok(()),
        };
        for bits in members {
            self.submit(JobHandle::unpack(bits))?;
        }
        Ok(())
    }

    /// Registers the job to submit when the last member finishes. Must be
    /// an un-submitted job; if the group already closed, it is submitted
    /// here so it still runs exactly once.
    pub fn group_set_continuation(&self, group: GroupHandle, continuation: JobHandle) {
        let Some(slot) = self.shared.groups.get(group) else {
            return;
        };
        slot.continuation.store(continuation.pack(), Ordering::Release);
        if slot.remaining.load(Ordering::Acquire) == 0 {
            let bits = slot.continuation.swap(0, Ordering::AcqRel);
            if bits != 0 {
                let _ = self.shared.submit_existing(JobHandle::unpack(bits));
            }
        }
    }

    /// Blocks until every member of the group has completed, helping with
    /// other work in the meantime. A stale handle returns immediately.
    pub fn group_wait(&self, group: GroupHandle) {
        let backoff = Backoff::new();
        loop {
            let open = self
                .shared
                .groups
                .get(group)
                .map(|slot| slot.remaining.load(Ordering::Acquire) > 0)
                .unwrap_or(false);
            if !open {
                return;
            }
            if worker::help_once() {
                continue;
            }
            if !crate::fiber::yield_parked() {
                if backoff.is_completed() {
                    std::thread::yield_now();
                } else {
                    backoff.snooze();
                }
            }
        }
    }

    /// Explicitly destroys a group. Call after
    /// [`group_wait`](Scheduler::group_wait); destroying a group with
    /// unfinished members is a precondition violation.
    pub fn group_destroy(&self, group: GroupHandle) {
        self.shared.groups.destroy(group);
    }

    /// Metadata for a live group; `None` once destroyed.
    pub fn group_info(&self, group: GroupHandle) -> Option<GroupInfo> {
        let slot = self.shared.groups.get(group)?;
        Some(GroupInfo {
            remaining: slot.remaining.load(Ordering::Acquire),
            total: slot.total.load(Ordering::Relaxed),
            created_ns: slot.created_ns.load(Ordering::Relaxed),
        })
    }

    /// Allocates scratch memory from the group's arena, while the group is
    /// alive. The pointer is valid until the group is destroyed.
    pub fn group_alloc(
        &self,
        group: GroupHandle,
        layout: std::alloc::Layout,
    ) -> Option<std::ptr::NonNull<u8>> {
        let slot = self.shared.groups.get(group)?;
        slot.with_arena(|arena| arena.alloc(layout))
    }

    // ---- queries ------------------------------------------------------

    /// Id of the worker the caller runs on, when it is one.
    pub fn current_worker_id(&self) -> Option<u32> {
        worker::with_current(|ctx| ctx.map(|c| c.id))
    }

    /// Handle of the job the caller is executing, or the none handle.
    pub fn current_job(&self) -> JobHandle {
        worker::with_current(|ctx| match ctx {
            Some(c) => JobHandle::unpack(c.current_job.get()),
            None => JobHandle::NONE,
        })
    }

    /// Timing record for a live job; stale handles return `None`.
    pub fn perf_info(&self, handle: JobHandle) -> Option<JobPerfInfo> {
        let slot = self.shared.jobs.get(handle)?;
        Some(JobPerfInfo {
            created_ns: slot.created_ns.load(Ordering::Relaxed),
            started_ns: slot.started_ns.load(Ordering::Relaxed),
            completed_ns: slot.completed_ns.load(Ordering::Relaxed),
            worker_id: slot.worker_id.load(Ordering::Relaxed),
            dependent_count: slot.dependent_count.load(Ordering::Relaxed),
        })
    }

    /// Snapshot of pool and per-worker counters.
    pub fn stats(&self) -> PoolStats {
        let shared = &*self.shared;
        PoolStats {
            worker_count: shared.worker_count() as u32,
            sleeping_workers: shared.sleeping.load(Ordering::Relaxed),
            tasks_submitted: shared.pool_counters.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: shared.pool_counters.tasks_completed.load(Ordering::Relaxed),
            tasks_cancelled: shared.pool_counters.tasks_cancelled.load(Ordering::Relaxed),
            global_pushes: shared.pool_counters.global_pushes.load(Ordering::Relaxed),
            wakeups: shared.pool_counters.wakeups.load(Ordering::Relaxed),
            global_queue_len: shared.global_queue.len(),
            high_priority_queue_len: shared.high_queue.len(),
            workers: shared
                .worker_counters
                .iter()
                .enumerate()
                .map(|(id, counters)| {
                    counters.snapshot(id as u32, shared.topology.node_of(id as u32))
                })
                .collect(),
        }
    }

    /// The detected (or synthetic) topology.
    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    // ---- profiler -----------------------------------------------------

    /// Starts a profiler frame, discarding the previous one.
    pub fn frame_start(&self) {
        self.shared.profiler.frame_start(self.shared.now_ns());
    }

    /// Ends the frame and returns everything recorded in it.
    pub fn frame_end(&self) -> FrameProfile {
        self.shared.profiler.frame_end(self.shared.now_ns())
    }

    /// Records a span into the current frame, for embedder systems that
    /// time work outside the job bodies. Lock-free and infallible.
    pub fn record_job(&self, start_ns: u64, end_ns: u64, worker_id: u32, name: &'static str) {
        self.shared.profiler.record(JobTrace {
            start_ns,
            end_ns,
            worker_id,
            name,
        });
    }

    /// Nanoseconds since the scheduler started; the clock all recorded
    /// timestamps share.
    pub fn now_ns(&self) -> u64 {
        self.shared.now_ns()
    }

    // ---- lifecycle ----------------------------------------------------

    /// Signals quit, wakes and joins every worker, and demotes worker 0 if
    /// the caller is it. Idempotent; also runs when the last clone drops.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        shared.shutdown.store(true, Ordering::SeqCst);
        shared.wake_workers();
        for handle in shared.join_handles.lock().unwrap().drain(..) {
            if handle.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
        worker::uninstall_main();
        log::debug!(
            "fiberloom: shut down after {} completed / {} cancelled jobs",
            shared.pool_counters.tasks_completed.load(Ordering::Relaxed),
            shared.pool_counters.tasks_cancelled.load(Ordering::Relaxed)
        );
    }
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        self.shared.owners.fetch_add(1, Ordering::Relaxed);
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.shared.owners.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shutdown();
        }
    }
}

/// Parks the current fiber so other jobs can run, then resumes. Outside a
/// job body this degrades to an OS thread yield.
pub fn yield_now() {
    if !crate::fiber::yield_parked() {
        std::thread::yield_now();
    }
}
