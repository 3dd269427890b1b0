//! Lock-free work-stealing deque and the bounded global injector queue.
//!
//! The deque is a Chase–Lev ring: the owning worker pushes and pops at the
//! bottom, thieves steal from the top with a CAS. Entries are packed job
//! handles (`u64`), `0` meaning "no job". Indices are 64-bit and monotonic,
//! so wraparound is not a concern within a process lifetime.

use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

// Ring entries are packed job handles; 0 never names a live job and marks
// an empty cell.

/// Outcome of a steal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal {
    /// A job was stolen.
    Success(u64),
    /// The queue was observed empty.
    Empty,
    /// Lost a race with the owner or another thief; worth retrying elsewhere.
    Retry,
}

struct Ring {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    mask: i64,
    slots: Box<[AtomicU64]>,
}

impl Ring {
    fn new(capacity: usize) -> Ring {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Ring {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            mask: capacity as i64 - 1,
            slots,
        }
    }

    #[inline]
    fn slot(&self, index: i64) -> &AtomicU64 {
        &self.slots[(index & self.mask) as usize]
    }
}

/// Owner side of a work-stealing deque. Exactly one thread may call
/// [`push_bottom`](WorkerQueue::push_bottom) and
/// [`pop_bottom`](WorkerQueue::pop_bottom); hand out [`Stealer`]s to
/// everyone else.
pub struct WorkerQueue {
    ring: Arc<Ring>,
}

/// Thief side of a work-stealing deque; cheap to clone and share.
#[derive(Clone)]
pub struct Stealer {
    ring: Arc<Ring>,
}

impl WorkerQueue {
    /// Creates a deque of `capacity` entries (rounded up to a power of two)
    /// and returns the owner handle plus a stealer for it.
    pub fn new(capacity: usize) -> (WorkerQueue, Stealer) {
        let capacity = capacity.next_power_of_two().max(2);
        let ring = Arc::new(Ring::new(capacity));
        (
            WorkerQueue { ring: ring.clone() },
            Stealer { ring },
        )
    }

    /// Pushes a job at the bottom. Fails when the ring is full; the caller
    /// falls back to the global queue.
    pub fn push_bottom(&self, job: u64) -> Result<(), u64> {
        debug_assert_ne!(job, 0);
        let ring = &*self.ring;
        let b = ring.bottom.load(Ordering::Relaxed);
        let t = ring.top.load(Ordering::Acquire);
        if b - t > ring.mask {
            return Err(job);
        }
        ring.slot(b).store(job, Ordering::Relaxed);
        // Publish the slot write before the new bottom becomes visible.
        ring.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Pops the most recently pushed job, racing thieves for the last one.
    pub fn pop_bottom(&self) -> Option<u64> {
        let ring = &*self.ring;
        let b = ring.bottom.load(Ordering::Relaxed) - 1;
        ring.bottom.store(b, Ordering::Relaxed);
        // The decremented bottom must be globally visible before top is
        // read, or a thief could observe a shorter queue than exists.
        fence(Ordering::SeqCst);
        let t = ring.top.load(Ordering::Relaxed);

        if t > b {
            // Empty; restore.
            ring.bottom.store(t, Ordering::Relaxed);
            return None;
        }

        let job = ring.slot(b).load(Ordering::Relaxed);
        if t == b {
            // Last element: exactly one of owner and thief may take it.
            let won = ring
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            ring.bottom.store(t + 1, Ordering::Relaxed);
            return won.then_some(job);
        }
        Some(job)
    }

    /// Approximate number of queued jobs.
    pub fn len(&self) -> usize {
        let b = self.ring.bottom.load(Ordering::Relaxed);
        let t = self.ring.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Stealer {
    /// Attempts to steal the oldest job.
    pub fn steal_top(&self) -> Steal {
        let ring = &*self.ring;
        let t = ring.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = ring.bottom.load(Ordering::Acquire);
        if t >= b {
            return Steal::Empty;
        }
        let job = ring.slot(t).load(Ordering::Relaxed);
        if ring
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Success(job)
        } else {
            Steal::Retry
        }
    }

    /// Approximate number of queued jobs.
    pub fn len(&self) -> usize {
        let b = self.ring.bottom.load(Ordering::Relaxed);
        let t = self.ring.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Cell {
    sequence: AtomicU64,
    job: AtomicU64,
}

/// Bounded multi-producer global queue, drained through
/// [`steal_top`](InjectorQueue::steal_top) like the per-worker deques.
///
/// Producers claim a cell with a CAS on the push index; per-cell sequence
/// numbers keep a thief from reading a cell whose value has not been
/// published yet, which a bare ring cannot rule out with multiple pushers.
pub struct InjectorQueue {
    push_pos: CachePadded<AtomicU64>,
    steal_pos: CachePadded<AtomicU64>,
    mask: u64,
    cells: Box<[Cell]>,
}

impl InjectorQueue {
    pub fn new(capacity: usize) -> InjectorQueue {
        let capacity = capacity.next_power_of_two().max(2);
        let cells = (0..capacity as u64)
            .map(|i| Cell {
                sequence: AtomicU64::new(i),
                job: AtomicU64::new(0),
            })
            .collect();
        InjectorQueue {
            push_pos: CachePadded::new(AtomicU64::new(0)),
            steal_pos: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            cells,
        }
    }

    /// Enqueues a job from any thread. Fails when the queue is full.
    pub fn push(&self, job: u64) -> Result<(), u64> {
        debug_assert_ne!(job, 0);
        let mut pos = self.push_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;
            if diff == 0 {
                match self.push_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.job.store(job, Ordering::Relaxed);
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(job);
            } else {
                pos = self.push_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest job, or `None` when empty.
    pub fn steal_top(&self) -> Option<u64> {
        let mut pos = self.steal_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos + 1) as i64;
            if diff == 0 {
                match self.steal_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let job = cell.job.load(Ordering::Relaxed);
                        cell.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(job);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.steal_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        let p = self.push_pos.load(Ordering::Relaxed);
        let s = self.steal_pos.load(Ordering::Relaxed);
        p.saturating_sub(s) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let (q, _s) = WorkerQueue::new(8);
        q.push_bottom(1).unwrap();
        q.push_bottom(2).unwrap();
        q.push_bottom(3).unwrap();
        assert_eq!(q.pop_bottom(), Some(3));
        assert_eq!(q.pop_bottom(), Some(2));
        assert_eq!(q.pop_bottom(), Some(1));
        assert_eq!(q.pop_bottom(), None);
    }

    #[test]
    fn steal_is_fifo() {
        let (q, s) = WorkerQueue::new(8);
        q.push_bottom(1).unwrap();
        q.push_bottom(2).unwrap();
        q.push_bottom(3).unwrap();
        assert_eq!(s.steal_top(), Steal::Success(1));
        assert_eq!(s.steal_top(), Steal::Success(2));
        assert_eq!(s.steal_top(), Steal::Success(3));
        assert_eq!(s.steal_top(), Steal::Empty);
    }

    #[test]
    fn push_reports_full() {
        let (q, _s) = WorkerQueue::new(4);
        for i in 1..=4 {
            q.push_bottom(i).unwrap();
        }
        assert_eq!(q.push_bottom(5), Err(5));
        assert_eq!(q.pop_bottom(), Some(4));
        q.push_bottom(5).unwrap();
    }

    #[test]
    fn injector_round_trips_across_capacity() {
        let q = InjectorQueue::new(4);
        for round in 0..3u64 {
            for i in 1..=4 {
                q.push(round * 10 + i).unwrap();
            }
            assert!(q.push(99).is_err());
            for i in 1..=4 {
                assert_eq!(q.steal_top(), Some(round * 10 + i));
            }
            assert_eq!(q.steal_top(), None);
        }
    }
}
