//! Stackful fibers backing job execution.
//!
//! Each fiber runs a trampoline loop: execute the job it was handed, signal
//! `Done`, and suspend until the worker hands it the next one. A job body
//! that parks (`yield_now`, or `wait` with nothing to help with) suspends
//! the fiber mid-body with `Parked`; the worker shelves it and resumes it
//! later on the same thread — suspended fibers never migrate.

use std::cell::Cell;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::scheduler::Shared;

/// What a worker feeds into a fiber.
pub(crate) enum FiberInput {
    /// Execute the job in `slot`. The pointer is the scheduler's `Shared`
    /// block, alive for as long as any worker runs.
    Run {
        shared: *const Shared,
        slot: u32,
    },
    /// Continue a body suspended by `Parked`.
    Resume,
    /// Unwind the trampoline loop.
    Shutdown,
}

/// What a fiber reports back when it suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberSignal {
    /// The job ran to completion; the fiber is idle and reusable.
    Done,
    /// The job parked mid-body; resume with [`FiberInput::Resume`].
    Parked,
}

pub(crate) enum FiberRun {
    Signal(FiberSignal),
    /// The trampoline returned (shutdown); the fiber is spent.
    Finished,
}

type YielderPtr = *const Yielder<FiberInput, FiberSignal>;

thread_local! {
    /// Yielder of the innermost fiber currently executing on this thread,
    /// or null outside any fiber.
    static CURRENT_YIELDER: Cell<YielderPtr> = const { Cell::new(std::ptr::null()) };
}

/// Swaps the current-yielder pointer, returning the previous value. Workers
/// bracket every `resume` with this so nested helping restores the right
/// fiber context.
pub(crate) fn swap_yielder(ptr: YielderPtr) -> YielderPtr {
    CURRENT_YIELDER.replace(ptr)
}

/// Parks the current fiber, returning control to the worker loop. Returns
/// `false` when not running on a fiber (the caller falls back to a thread
/// pause).
pub(crate) fn yield_parked() -> bool {
    let yielder = CURRENT_YIELDER.get();
    if yielder.is_null() {
        return false;
    }
    // SAFETY: the pointer is non-null only while the owning fiber is live
    // and running on this thread; suspend switches back to the worker.
    let input = unsafe { (*yielder).suspend(FiberSignal::Parked) };
    debug_assert!(matches!(input, FiberInput::Resume));
    // Restore after resumption: the worker nulled it while we were parked.
    CURRENT_YIELDER.set(yielder);
    true
}

/// A pooled fiber: a coroutine whose trampoline executes one job per
/// hand-off and then waits for the next.
pub(crate) struct JobFiber {
    co: Coroutine<FiberInput, FiberSignal, ()>,
}

impl JobFiber {
    pub(crate) fn new(stack_size: usize) -> std::io::Result<JobFiber> {
        let stack = DefaultStack::new(stack_size)?;
        let co = Coroutine::with_stack(stack, |yielder, mut input: FiberInput| loop {
            match input {
                FiberInput::Run { shared, slot } => {
                    CURRENT_YIELDER.set(yielder as YielderPtr);
                    // SAFETY: the worker guarantees `shared` outlives the run.
                    let shared = unsafe { &*shared };
                    crate::worker::run_job_body(shared, slot);
                }
                FiberInput::Resume => {
                    debug_assert!(false, "idle fiber resumed without a job");
                }
                FiberInput::Shutdown => return,
            }
            CURRENT_YIELDER.set(std::ptr::null());
            input = yielder.suspend(FiberSignal::Done);
        });
        Ok(JobFiber { co })
    }

    pub(crate) fn resume(&mut self, input: FiberInput) -> FiberRun {
        match self.co.resume(input) {
            CoroutineResult::Yield(signal) => FiberRun::Signal(signal),
            CoroutineResult::Return(()) => FiberRun::Finished,
        }
    }
}
