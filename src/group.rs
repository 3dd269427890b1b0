//! Task groups: barriers over a set of jobs with an optional continuation
//! and an owned scratch arena.
//!
//! Groups live in their own generation-tagged slot table so jobs can refer
//! to them by index without ownership cycles. A group is never destroyed
//! automatically — the embedder destroys it once it is done observing it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::arena::Arena;
use crate::job::JobHandle;

/// Default arena capacity a group starts with.
const GROUP_ARENA_BYTES: usize = 64 * 1024;

/// Names a group. Stale handles (the group was destroyed) make every
/// operation a no-op and every wait return immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    index: u32,
    generation: u32,
}

impl GroupHandle {
    pub const NONE: GroupHandle = GroupHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_none(&self) -> bool {
        self.index == u32::MAX
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}

pub(crate) struct GroupSlot {
    live: AtomicU8,
    generation: AtomicU32,
    pub(crate) remaining: AtomicU32,
    pub(crate) total: AtomicU32,
    /// Packed handle of the continuation job, 0 when unset. Swapped to 0 by
    /// whoever submits it, so it runs exactly once.
    pub(crate) continuation: AtomicU64,
    /// Packed handles of the jobs added to this group.
    pub(crate) members: Mutex<Vec<u64>>,
    arena: Mutex<Option<Arena>>,
    pub(crate) created_ns: AtomicU64,
}

impl GroupSlot {
    fn new() -> GroupSlot {
        GroupSlot {
            live: AtomicU8::new(0),
            generation: AtomicU32::new(0),
            remaining: AtomicU32::new(0),
            total: AtomicU32::new(0),
            continuation: AtomicU64::new(0),
            members: Mutex::new(Vec::new()),
            arena: Mutex::new(None),
            created_ns: AtomicU64::new(0),
        }
    }

    /// Runs `f` against the group arena while it is alive.
    pub(crate) fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> R) -> Option<R> {
        let guard = self.arena.lock().unwrap();
        guard.as_ref().map(f)
    }
}

pub(crate) struct GroupTable {
    slots: Box<[GroupSlot]>,
    cursor: AtomicU32,
}

impl GroupTable {
    pub(crate) fn new(capacity: usize) -> GroupTable {
        let capacity = capacity.max(1);
        GroupTable {
            slots: (0..capacity).map(|_| GroupSlot::new()).collect(),
            cursor: AtomicU32::new(0),
        }
    }

    pub(crate) fn slot(&self, index: u32) -> &GroupSlot {
        &self.slots[index as usize]
    }

    pub(crate) fn get(&self, handle: GroupHandle) -> Option<&GroupSlot> {
        if handle.is_none() || handle.index as usize >= self.slots.len() {
            return None;
        }
        let slot = &self.slots[handle.index as usize];
        (slot.generation.load(Ordering::Acquire) == handle.generation
            && slot.live.load(Ordering::Acquire) == 1)
            .then_some(slot)
    }

    /// Claims a group slot. `member_hint` pre-sizes the member list.
    pub(crate) fn create(&self, member_hint: usize, now_ns: u64) -> Option<GroupHandle> {
        let len = self.slots.len();
        for _ in 0..len {
            let n = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % len;
            let slot = &self.slots[n];
            if slot
                .live
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.remaining.store(0, Ordering::Relaxed);
                slot.total.store(0, Ordering::Relaxed);
                slot.continuation.store(0, Ordering::Relaxed);
                slot.created_ns.store(now_ns, Ordering::Relaxed);
                {
                    let mut members = slot.members.lock().unwrap();
                    members.clear();
                    members.reserve(member_hint);
                }
                *slot.arena.lock().unwrap() = Some(Arena::new(GROUP_ARENA_BYTES));
                return Some(GroupHandle {
                    index: n as u32,
                    generation: slot.generation.load(Ordering::Acquire),
                });
            }
        }
        None
    }

    /// Decrements the remaining count for a finished member. When the group
    /// closes, returns the continuation handle to submit (at most once).
    pub(crate) fn finish_member(&self, index: u32) -> Option<JobHandle> {
        let slot = self.slot(index);
        let before = slot.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "group member finished twice");
        if before != 1 {
            return None;
        }
        let bits = slot.continuation.swap(0, Ordering::AcqRel);
        (bits != 0).then(|| JobHandle::unpack(bits))
    }

    /// Tears a group down. Destroying a group that still has unfinished
    /// members is a precondition violation; it is refused here because a
    /// finishing member would otherwise decrement a recycled slot.
    pub(crate) fn destroy(&self, handle: GroupHandle) {
        let Some(slot) = self.get(handle) else { return };
        let remaining = slot.remaining.load(Ordering::Acquire);
        debug_assert_eq!(remaining, 0, "destroying a group with unfinished members");
        if remaining != 0 {
            log::warn!("refusing to destroy group with {remaining} unfinished members");
            return;
        }
        slot.members.lock().unwrap().clear();
        *slot.arena.lock().unwrap() = None;
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.live.store(0, Ordering::Release);
    }
}
