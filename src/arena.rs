//! Chained bump allocator backing group scratch memory.
//!
//! A single region is allocated up front and further regions are chained on
//! demand, so `alloc` never fails until the process allocator does. Resets
//! keep the first region and drop the chain. Allocation happens under a
//! short mutex because group members allocate from several workers at once.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

const CHUNK_ALIGN: usize = 16;

struct Chunk {
    base: NonNull<u8>,
    capacity: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Chunk {
        let layout = Layout::from_size_align(capacity, CHUNK_ALIGN).expect("invalid arena layout");
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).expect("arena chunk allocation failed");
        Chunk { base, capacity }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, CHUNK_ALIGN).unwrap();
        // SAFETY: base was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

// SAFETY: chunks own their allocation; the raw pointer is not aliased
// outside the arena's own bookkeeping.
unsafe impl Send for Chunk {}

struct ArenaInner {
    chunks: Vec<Chunk>,
    /// Bump offset into the last chunk.
    cursor: usize,
}

/// Growable bump arena. All outstanding allocations are invalidated by
/// [`reset`](Arena::reset) at once; there is no per-allocation free.
pub struct Arena {
    inner: Mutex<ArenaInner>,
    base_capacity: usize,
}

impl Arena {
    /// Creates an arena with one region of `capacity` bytes.
    pub fn new(capacity: usize) -> Arena {
        let capacity = capacity.max(64);
        Arena {
            inner: Mutex::new(ArenaInner {
                chunks: vec![Chunk::new(capacity)],
                cursor: 0,
            }),
            base_capacity: capacity,
        }
    }

    /// Allocates `layout.size()` bytes at `layout.align()`, growing the
    /// chain when the current region cannot fit the request.
    pub fn alloc(&self, layout: Layout) -> NonNull<u8> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let (base, capacity) = {
                let chunk = inner.chunks.last().expect("arena has no chunks");
                (chunk.base.as_ptr() as usize, chunk.capacity)
            };
            let aligned = (base + inner.cursor + layout.align() - 1) & !(layout.align() - 1);
            let end = aligned + layout.size();
            if end <= base + capacity {
                inner.cursor = end - base;
                // SAFETY: aligned lies inside the live chunk.
                return unsafe { NonNull::new_unchecked(aligned as *mut u8) };
            }
            let grow = (capacity * 2).max(layout.size() + layout.align());
            inner.chunks.push(Chunk::new(grow));
            inner.cursor = 0;
        }
    }

    /// Allocates storage for `value` and moves it in. The value is *not*
    /// dropped by the arena; callers use this for plain-data scratch.
    pub fn alloc_val<T>(&self, value: T) -> NonNull<T> {
        let ptr = self.alloc(Layout::new::<T>()).cast::<T>();
        // SAFETY: freshly allocated, properly aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        ptr
    }

    /// Reclaims everything, keeping only the first region.
    ///
    /// # Safety
    ///
    /// Invalidates every pointer previously handed out by this arena.
    pub unsafe fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.chunks.truncate(1);
        inner.cursor = 0;
    }

    /// Bytes handed out of the current region (chained regions excluded).
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().unwrap().cursor
    }

    pub fn base_capacity(&self) -> usize {
        self.base_capacity
    }
}
