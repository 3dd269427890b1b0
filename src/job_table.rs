//! Pre-sized slab of job slots with generation-tagged reuse.
//!
//! Allocation is a bounded search: an atomic cursor spreads probes across
//! the table and a CAS from `Free` to `Pending` claims a slot. Retirement
//! bumps the generation *before* the slot returns to `Free`, so observing
//! `Free` under a matching generation is impossible and every stale handle
//! reads as completed.

use std::sync::atomic::Ordering;

use crate::job::{JobHandle, JobPayload, JobSlot, JobState, INLINE_DEPENDENTS, NO_GROUP};

pub(crate) struct JobTable {
    slots: Box<[JobSlot]>,
    cursor: std::sync::atomic::AtomicU32,
}

impl JobTable {
    /// Builds a table of `capacity` slots. Slot 0 is reserved so the packed
    /// none handle (`0`) can never name a live job.
    pub(crate) fn new(capacity: usize) -> JobTable {
        let capacity = capacity.max(2);
        let slots = (0..capacity).map(|_| JobSlot::new()).collect();
        JobTable {
            slots,
            cursor: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    pub(crate) fn slot(&self, index: u32) -> &JobSlot {
        &self.slots[index as usize]
    }

    /// Resolves a handle, returning the slot only while the generation still
    /// matches.
    pub(crate) fn get(&self, handle: JobHandle) -> Option<&JobSlot> {
        if handle.is_none() {
            return None;
        }
        let slot = self.slot(handle.index());
        if slot.generation.load(Ordering::Acquire) == handle.generation() {
            Some(slot)
        } else {
            None
        }
    }

    /// State visible through a handle. Stale handles (and the none handle)
    /// read as `Completed` — the success-equivalent the callers expect.
    pub(crate) fn state_of(&self, handle: JobHandle) -> JobState {
        match self.get(handle) {
            None => JobState::Completed,
            Some(slot) => {
                let state = JobState::from_u8(slot.state.load(Ordering::Acquire));
                if state == JobState::Free {
                    // Mid-retirement: the generation bump is about to land.
                    JobState::Completed
                } else {
                    state
                }
            }
        }
    }

    /// Claims a free slot and resets it to `Pending` with one guard
    /// dependency. Returns `None` when the table is exhausted after probing
    /// every slot once.
    pub(crate) fn allocate(&self) -> Option<u32> {
        let len = self.slots.len();
        for _ in 0..len - 1 {
            let n = self.cursor.fetch_add(1, Ordering::Relaxed);
            let index = 1 + (n as usize % (len - 1));
            let slot = &self.slots[index];
            if slot
                .state
                .compare_exchange(
                    JobState::Free as u8,
                    JobState::Pending as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                slot.incoming_deps.store(1, Ordering::Relaxed);
                slot.dependent_count.store(0, Ordering::Relaxed);
                for d in &slot.dependents {
                    d.store(0, Ordering::Relaxed);
                }
                slot.overflow.lock().unwrap().clear();
                slot.group.store(NO_GROUP, Ordering::Relaxed);
                slot.arena_group.store(NO_GROUP, Ordering::Relaxed);
                slot.parent.store(0, Ordering::Relaxed);
                slot.priority.store(0, Ordering::Relaxed);
                slot.stack_class.store(0, Ordering::Relaxed);
                slot.started_ns.store(0, Ordering::Relaxed);
                slot.completed_ns.store(0, Ordering::Relaxed);
                slot.worker_id.store(0, Ordering::Relaxed);
                return Some(index as u32);
            }
        }
        None
    }

    /// Handle for a freshly allocated (still live) slot.
    pub(crate) fn handle_for(&self, index: u32) -> JobHandle {
        JobHandle::new(index, self.slot(index).generation.load(Ordering::Acquire))
    }

    /// Appends `dependent` to `prerequisite`'s outgoing list and returns the
    /// position. The caller has already incremented the dependent's fan-in;
    /// the SeqCst entry store orders the append against the prerequisite's
    /// completion check (see `consume_dependent`).
    pub(crate) fn append_dependent(&self, prerequisite: &JobSlot, dependent: u32) -> u32 {
        let n = prerequisite.dependent_count.fetch_add(1, Ordering::SeqCst);
        if (n as usize) < INLINE_DEPENDENTS {
            prerequisite.dependents[n as usize].store(dependent, Ordering::SeqCst);
        } else {
            prerequisite.overflow.lock().unwrap().push(dependent);
        }
        n
    }

    /// Consumes the dependent entry at `position`, if still unconsumed.
    ///
    /// Both the completer and a linker that lost the completion race funnel
    /// through this swap, so each appended dependent is released exactly
    /// once no matter how the append interleaves with completion.
    pub(crate) fn consume_dependent(&self, prerequisite: &JobSlot, position: u32) -> Option<u32> {
        if (position as usize) < INLINE_DEPENDENTS {
            let taken = prerequisite.dependents[position as usize].swap(0, Ordering::SeqCst);
            (taken != 0).then_some(taken)
        } else {
            let mut overflow = prerequisite.overflow.lock().unwrap();
            // Overflow entries are unordered; consume any one that is there.
            overflow.pop()
        }
    }

    /// Removes a specific dependent from the overflow list, returning
    /// whether the linker (not the completer) consumed it.
    pub(crate) fn unlink_overflow_dependent(
        &self,
        prerequisite: &JobSlot,
        dependent: u32,
    ) -> bool {
        let mut overflow = prerequisite.overflow.lock().unwrap();
        if let Some(at) = overflow.iter().position(|&d| d == dependent) {
            overflow.swap_remove(at);
            true
        } else {
            false
        }
    }

    /// Retires a terminal slot: bump the generation so outstanding handles
    /// go stale, drop the payload, then return the slot to the free list.
    /// Waits for in-flight dependency linkers first, so their appends land
    /// in a slot that still reads as terminal rather than in a recycled one.
    pub(crate) fn retire(&self, index: u32) {
        let slot = self.slot(index);
        debug_assert!(
            JobState::from_u8(slot.state.load(Ordering::Relaxed)).is_terminal(),
            "retiring a non-terminal job slot"
        );
        while slot.link_pins.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        // SAFETY: the slot is terminal, so no other thread touches the
        // payload cell anymore; we are the single retiring worker.
        unsafe {
            *slot.payload.get() = JobPayload::Empty;
            *slot.name.get() = "";
        }
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.state.store(JobState::Free as u8, Ordering::Release);
    }
}
