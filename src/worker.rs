//! Worker threads: the scheduling loop and job execution.
//!
//! Each worker owns its deque, its fiber pool, a PRNG for victim choice,
//! and a shelf of fibers suspended by `yield_now`/`wait`. One loop
//! iteration drains local work, resumes a shelved fiber, steals through the
//! topology policy, falls back to the global queues, and finally idles:
//! first spinning with a CPU pause, then blocking on the pool's condvar.
//!
//! The thread that created the scheduler is registered here as worker 0 and
//! participates through the help path of `wait` instead of a loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::deque::{Steal, WorkerQueue};
use crate::fiber::{self, FiberInput, FiberRun, FiberSignal};
use crate::fiber_pool::{FiberKey, FiberPool};
use crate::job::{CoopStatus, JobHandle, JobPayload, JobState};
use crate::scheduler::Shared;

/// A fiber carrying a parked job, waiting to be resumed on this worker.
pub(crate) struct SuspendedFiber {
    fiber: fiber::JobFiber,
    key: FiberKey,
    job: u32,
}

/// Per-worker state. Lives on the worker's own thread (boxed on the main
/// thread for worker 0) and is reached through the thread-local below.
pub(crate) struct WorkerCtx {
    pub(crate) id: u32,
    pub(crate) shared: Arc<Shared>,
    pub(crate) queue: WorkerQueue,
    pub(crate) fibers: FiberPool,
    pub(crate) rng: Cell<u32>,
    pub(crate) resumables: RefCell<VecDeque<SuspendedFiber>>,
    /// Packed handle of the job currently executing on this worker.
    pub(crate) current_job: Cell<u64>,
}

impl WorkerCtx {
    pub(crate) fn new(id: u32, queue: WorkerQueue, shared: Arc<Shared>) -> WorkerCtx {
        let seed = (id.wrapping_mul(0x9e37_79b9)) ^ shared.now_ns() as u32;
        WorkerCtx {
            id,
            shared,
            queue,
            fibers: FiberPool::new(),
            rng: Cell::new(seed | 1),
            resumables: RefCell::new(VecDeque::new()),
            current_job: Cell::new(0),
        }
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerCtx> = const { Cell::new(std::ptr::null()) };
    /// Keeps worker 0's context alive on the thread that created the
    /// scheduler; dropped when the scheduler shuts down (demotion).
    static MAIN_CTX: RefCell<Option<Box<WorkerCtx>>> = const { RefCell::new(None) };
}

/// Runs `f` with the calling thread's worker context, if it has one.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&WorkerCtx>) -> R) -> R {
    let ptr = CURRENT_WORKER.get();
    if ptr.is_null() {
        f(None)
    } else {
        // SAFETY: the pointer is set only while the pointee is alive — the
        // worker's stack frame, or the MAIN_CTX box for worker 0.
        f(Some(unsafe { &*ptr }))
    }
}

/// Promotes the calling thread to worker 0.
pub(crate) fn install_main(ctx: Box<WorkerCtx>) {
    let ptr: *const WorkerCtx = &*ctx;
    MAIN_CTX.with(|main| {
        debug_assert!(main.borrow().is_none(), "worker 0 already installed");
        *main.borrow_mut() = Some(ctx);
    });
    CURRENT_WORKER.set(ptr);
}

/// Demotes worker 0. A no-op on threads that never installed it, so
/// shutting down from another thread only delays the demotion to thread
/// exit.
pub(crate) fn uninstall_main() {
    MAIN_CTX.with(|main| {
        if main.borrow_mut().take().is_some() {
            CURRENT_WORKER.set(std::ptr::null());
        }
    });
}

/// One helping step for `wait`-style loops: find and run (or resume) a
/// single job. Returns false when the caller is not a worker or there was
/// nothing to do.
pub(crate) fn help_once() -> bool {
    with_current(|ctx| match ctx {
        Some(ctx) => {
            if let Some(bits) = find_work(ctx) {
                execute(ctx, bits);
                return true;
            }
            let suspended = ctx.resumables.borrow_mut().pop_front();
            match suspended {
                Some(suspended) => resume_suspended(ctx, suspended),
                None => false,
            }
        }
        None => false,
    })
}

/// Entry point of spawned worker threads.
pub(crate) fn worker_main(id: u32, queue: WorkerQueue, shared: Arc<Shared>) {
    if shared.config.pin_workers {
        if let Some(core) = shared.topology.pin_core_for(id) {
            if !core_affinity::set_for_current(core) {
                log::debug!("worker {id}: could not pin to core {}", core.id);
            }
        }
    }

    let ctx = Box::new(WorkerCtx::new(id, queue, Arc::clone(&shared)));
    CURRENT_WORKER.set(&*ctx as *const WorkerCtx);

    let mut idle_spins = 0u32;
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Some(bits) = find_work(&ctx) {
            execute(&ctx, bits);
            idle_spins = 0;
            continue;
        }
        // No runnable job anywhere: give parked fibers a turn. A fiber
        // that parks right back does not count as progress, or a lone
        // waiter would pin the core.
        let suspended = ctx.resumables.borrow_mut().pop_front();
        if let Some(suspended) = suspended {
            if resume_suspended(&ctx, suspended) {
                idle_spins = 0;
                continue;
            }
        }

        idle_spins += 1;
        if idle_spins < shared.config.max_idle_spins {
            std::hint::spin_loop();
        } else {
            idle_sleep(&ctx);
            idle_spins = 0;
        }
    }

    CURRENT_WORKER.set(std::ptr::null());
    // Dropping ctx unwinds any fiber still parked here.
}

fn pop_local(ctx: &WorkerCtx) -> Option<u64> {
    let bits = ctx.queue.pop_bottom()?;
    ctx.shared.worker_counters[ctx.id as usize]
        .local_pops
        .fetch_add(1, Ordering::Relaxed);
    Some(bits)
}

fn steal_round(ctx: &WorkerCtx) -> Option<u64> {
    let shared = &*ctx.shared;
    let counters = &shared.worker_counters[ctx.id as usize];
    let mut rng = ctx.rng.get();
    let mut found = None;
    for _ in 0..shared.config.steal_attempts_per_round {
        let Some(victim) = shared.topology.select_victim(ctx.id, &mut rng) else {
            break;
        };
        counters.steals_attempted.fetch_add(1, Ordering::Relaxed);
        match shared.stealers[victim as usize].steal_top() {
            Steal::Success(bits) => {
                counters.steals_succeeded.fetch_add(1, Ordering::Relaxed);
                found = Some(bits);
                break;
            }
            Steal::Empty | Steal::Retry => {}
        }
    }
    ctx.rng.set(rng);
    found
}

fn pop_global(ctx: &WorkerCtx) -> Option<u64> {
    let shared = &*ctx.shared;
    shared
        .high_queue
        .steal_top()
        .or_else(|| shared.global_queue.steal_top())
}

/// Finding step shared by the worker loop and the help path: local, steal,
/// then global.
pub(crate) fn find_work(ctx: &WorkerCtx) -> Option<u64> {
    pop_local(ctx)
        .or_else(|| steal_round(ctx))
        .or_else(|| pop_global(ctx))
}

fn idle_sleep(ctx: &WorkerCtx) {
    let shared = &*ctx.shared;
    shared.worker_counters[ctx.id as usize]
        .sleeps
        .fetch_add(1, Ordering::Relaxed);
    shared.sleeping.fetch_add(1, Ordering::SeqCst);
    {
        let guard = shared.sleep_mutex.lock().unwrap();
        let work_visible = !ctx.queue.is_empty()
            || !shared.high_queue.is_empty()
            || !shared.global_queue.is_empty()
            || !ctx.resumables.borrow().is_empty();
        if !work_visible && !shared.shutdown.load(Ordering::Acquire) {
            // Bounded wait: pushes into *other* workers' deques are not
            // visible to this predicate, so never sleep unbounded.
            let _ = shared
                .wake_cond
                .wait_timeout(guard, Duration::from_millis(1));
        }
    }
    shared.sleeping.fetch_sub(1, Ordering::SeqCst);
}

/// Executes the job named by `bits` on this worker: binds a fiber (or the
/// worker's own stack when the pool is dry), records timing, and routes the
/// fiber's exit signal.
pub(crate) fn execute(ctx: &WorkerCtx, bits: u64) {
    let shared = &*ctx.shared;
    let handle = JobHandle::unpack(bits);
    let Some(slot) = shared.jobs.get(handle) else {
        // Retired between enqueue and execution; nothing to run.
        return;
    };
    if slot
        .state
        .compare_exchange(
            JobState::Ready as u8,
            JobState::Running as u8,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return;
    }
    slot.started_ns.store(shared.now_ns(), Ordering::Relaxed);
    slot.worker_id.store(ctx.id, Ordering::Relaxed);
    let stack_class = slot.stack_class_of(Ordering::Relaxed);

    let previous_job = ctx.current_job.replace(bits);
    match ctx.fibers.acquire(stack_class) {
        Some((key, mut fiber)) => {
            let previous_yielder = fiber::swap_yielder(std::ptr::null());
            let run = fiber.resume(FiberInput::Run {
                shared: shared as *const Shared,
                slot: handle.index(),
            });
            fiber::swap_yielder(previous_yielder);
            match run {
                FiberRun::Signal(FiberSignal::Done) => ctx.fibers.release(key, fiber),
                FiberRun::Signal(FiberSignal::Parked) => {
                    ctx.resumables.borrow_mut().push_back(SuspendedFiber {
                        fiber,
                        key,
                        job: handle.index(),
                    });
                }
                FiberRun::Finished => {}
            }
        }
        None => {
            // Every fiber is bound; run on the worker's own stack. A body
            // executed here cannot park — yield_now degrades to a thread
            // yield because no yielder is installed.
            let previous_yielder = fiber::swap_yielder(std::ptr::null());
            run_job_body(shared, handle.index());
            fiber::swap_yielder(previous_yielder);
        }
    }
    ctx.current_job.set(previous_job);
    shared.worker_counters[ctx.id as usize]
        .tasks_executed
        .fetch_add(1, Ordering::Relaxed);
}

/// Resumes a parked fiber. Returns true when its job ran to completion,
/// false when it parked again.
fn resume_suspended(ctx: &WorkerCtx, mut suspended: SuspendedFiber) -> bool {
    let shared = &*ctx.shared;
    let bits = shared.jobs.handle_for(suspended.job).pack();
    let previous_job = ctx.current_job.replace(bits);
    let previous_yielder = fiber::swap_yielder(std::ptr::null());
    let run = suspended.fiber.resume(FiberInput::Resume);
    fiber::swap_yielder(previous_yielder);
    let progressed = match run {
        FiberRun::Signal(FiberSignal::Done) => {
            ctx.fibers.release(suspended.key, suspended.fiber);
            true
        }
        FiberRun::Signal(FiberSignal::Parked) => {
            ctx.resumables.borrow_mut().push_back(suspended);
            false
        }
        FiberRun::Finished => true,
    };
    ctx.current_job.set(previous_job);
    progressed
}

/// Runs a job body to its next boundary: completion, cooperative yield, or
/// panic. Called from the fiber trampoline and from the inline fallback.
pub(crate) fn run_job_body(shared: &Shared, slot_index: u32) {
    let slot = shared.jobs.slot(slot_index);
    let payload_ptr = slot.payload.get();

    enum Outcome {
        Completed,
        Requeue,
    }

    // SAFETY (all payload accesses below): this worker moved the job to
    // Running, which grants exclusive access to the payload cell until the
    // body returns or parks. Borrows are scoped so the cell is never
    // replaced while a reference into it is live.
    let is_cooperative = matches!(unsafe { &*payload_ptr }, JobPayload::Cooperative(_));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        if is_cooperative {
            loop {
                let status = {
                    let JobPayload::Cooperative(step) = (unsafe { &mut *payload_ptr }) else {
                        unreachable!()
                    };
                    step()
                };
                match status {
                    CoopStatus::Continue => continue,
                    CoopStatus::Yield => break Outcome::Requeue,
                    CoopStatus::Complete => {
                        // The step closure stays in the slot across yields;
                        // drop it only now that the job is done.
                        unsafe { *payload_ptr = JobPayload::Empty };
                        break Outcome::Completed;
                    }
                }
            }
        } else {
            let taken = unsafe { std::ptr::replace(payload_ptr, JobPayload::Empty) };
            if let JobPayload::Once(body) = taken {
                body();
            }
            Outcome::Completed
        }
    }));

    match result {
        Ok(Outcome::Completed) => shared.finish_job(slot_index, false),
        Ok(Outcome::Requeue) => shared.requeue_yielded(slot_index),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.as_str()
            } else {
                "non-string panic payload"
            };
            // SAFETY: the body is done (it unwound); clear it here so its
            // captures are dropped before the slot is recycled.
            let name = unsafe { *slot.name.get() };
            unsafe { *payload_ptr = JobPayload::Empty };
            log::error!("job '{name}' panicked: {message}");
            shared.finish_job(slot_index, true);
        }
    }
}
