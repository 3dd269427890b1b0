//! Per-worker fiber pools.
//!
//! Two sub-pools per worker: small stacks for ordinary jobs and a handful of
//! large stacks for jobs flagged as deep. A free bit-mask tracks available
//! slots; fibers are created lazily the first time their bit is claimed.
//! The pool belongs to exactly one worker thread, so plain cells suffice.

use std::cell::{Cell, RefCell};

use crate::fiber::JobFiber;
use crate::job::StackClass;

pub(crate) const SMALL_STACK_SIZE: usize = 64 * 1024;
pub(crate) const LARGE_STACK_SIZE: usize = 256 * 1024;
const SMALL_COUNT: u32 = 16;
const LARGE_COUNT: u32 = 4;

/// Identifies the pool slot a fiber was taken from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FiberKey {
    class: StackClass,
    bit: u32,
}

struct SubPool {
    stack_size: usize,
    free_mask: Cell<u32>,
    fibers: Box<[RefCell<Option<JobFiber>>]>,
}

impl SubPool {
    fn new(count: u32, stack_size: usize) -> SubPool {
        debug_assert!(count < 32);
        SubPool {
            stack_size,
            free_mask: Cell::new((1u32 << count) - 1),
            fibers: (0..count).map(|_| RefCell::new(None)).collect(),
        }
    }

    fn acquire(&self) -> Option<(u32, JobFiber)> {
        let mask = self.free_mask.get();
        if mask == 0 {
            return None;
        }
        let bit = mask.trailing_zeros();
        self.free_mask.set(mask & !(1 << bit));

        let existing = self.fibers[bit as usize].borrow_mut().take();
        let fiber = match existing {
            Some(fiber) => fiber,
            None => match JobFiber::new(self.stack_size) {
                Ok(fiber) => fiber,
                Err(err) => {
                    log::warn!("fiber stack allocation failed: {err}");
                    self.free_mask.set(self.free_mask.get() | 1 << bit);
                    return None;
                }
            },
        };
        Some((bit, fiber))
    }

    fn release(&self, bit: u32, fiber: JobFiber) {
        debug_assert_eq!(self.free_mask.get() & (1 << bit), 0, "double release");
        *self.fibers[bit as usize].borrow_mut() = Some(fiber);
        self.free_mask.set(self.free_mask.get() | 1 << bit);
    }
}

pub(crate) struct FiberPool {
    small: SubPool,
    large: SubPool,
}

impl FiberPool {
    pub(crate) fn new() -> FiberPool {
        FiberPool {
            small: SubPool::new(SMALL_COUNT, SMALL_STACK_SIZE),
            large: SubPool::new(LARGE_COUNT, LARGE_STACK_SIZE),
        }
    }

    /// Takes a fiber out of the pool, or `None` when the sub-pool is fully
    /// bound (the caller then runs the job inline on its own stack).
    pub(crate) fn acquire(&self, class: StackClass) -> Option<(FiberKey, JobFiber)> {
        let pool = self.sub(class);
        pool.acquire()
            .map(|(bit, fiber)| (FiberKey { class, bit }, fiber))
    }

    pub(crate) fn release(&self, key: FiberKey, fiber: JobFiber) {
        self.sub(key.class).release(key.bit, fiber);
    }

    fn sub(&self, class: StackClass) -> &SubPool {
        match class {
            StackClass::Small => &self.small,
            StackClass::Large => &self.large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_and_releases() {
        let pool = FiberPool::new();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(StackClass::Large).expect("large fiber"));
        }
        assert!(pool.acquire(StackClass::Large).is_none());
        // Small pool is unaffected by large exhaustion.
        let (key, fiber) = pool.acquire(StackClass::Small).expect("small fiber");
        pool.release(key, fiber);

        let (key, fiber) = held.pop().unwrap();
        pool.release(key, fiber);
        assert!(pool.acquire(StackClass::Large).is_some());
    }
}
