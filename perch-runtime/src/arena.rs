//! Per-thread sample-path memory.
//!
//! Each thread owns one arena, acquired with `mmap` and carved with bump
//! pointers, so the sample path never touches the system allocator. The
//! layout follows the classic memstore shape:
//!
//! ```text
//!   +------------------+------------+----------------+
//!   |  freeable (CCT)  |   free     |  non-freeable  |
//!   +------------------+------------+----------------+
//!   start              low          high         start+size
//! ```
//!
//! The freeable region grows upward and is reclaimed wholesale after an
//! epoch write-out; the non-freeable region grows downward and lives until
//! process exit. A request larger than one fifth of the arena gets its own
//! dedicated mapping. When the non-freeable region fills up, a fresh
//! memstore replaces the current one; the old mapping is deliberately never
//! unmapped, because CCT nodes and epoch records in it remain reachable
//! from older epochs.

use std::cell::Cell;
use std::ptr::{self, NonNull};

#[derive(Debug, Clone, Copy)]
struct Memstore {
    start: *mut u8,
    low: *mut u8,
    high: *mut u8,
    size: usize,
}

#[derive(Debug)]
pub struct Arena {
    memsize: usize,
    low_memsize: usize,
    store: Cell<Option<Memstore>>,
    /// Set on the first allocation failure so the diagnostic fires once.
    oom_reported: Cell<bool>,
}

// The arena is owned by a single thread; `Send` lets the thread registry
// hand descriptors to the finalization path.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(memsize: usize, low_memsize: usize) -> Arena {
        let arena = Arena {
            memsize,
            low_memsize,
            store: Cell::new(None),
            oom_reported: Cell::new(false),
        };
        arena.store.set(mmap_anon(memsize));
        arena
    }

    /// Bump-allocates `size` bytes of non-freeable memory (8-byte aligned).
    ///
    /// Returns `None` only when `mmap` itself fails; the caller is expected
    /// to disable sampling for the thread and report once.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = round_up(size);

        // Oversized requests would dominate the arena; give them their own
        // mapping, which is never reclaimed.
        if size > self.memsize / 5 {
            return mmap_anon(size).map(|m| unsafe { NonNull::new_unchecked(m.start) });
        }

        let mut store = match self.store.get() {
            Some(store) if remaining(&store) >= size => store,
            _ => match mmap_anon(self.memsize) {
                Some(fresh) => fresh,
                None => return None,
            },
        };
        store.high = unsafe { store.high.sub(size) };
        let addr = store.high;
        self.store.set(Some(store));
        NonNull::new(addr)
    }

    /// Bump-allocates `size` bytes of freeable memory (8-byte aligned).
    ///
    /// Freeable memory is bounded by the current memstore so that a single
    /// [`Arena::reclaim_freeable`] recovers all of it. On exhaustion the
    /// caller should flush the epoch, reclaim, and retry.
    pub fn alloc_freeable(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = round_up(size);
        let mut store = self.store.get()?;
        if remaining(&store) < size {
            return None;
        }
        let addr = store.low;
        store.low = unsafe { store.low.add(size) };
        self.store.set(Some(store));
        NonNull::new(addr)
    }

    /// Resets the freeable region. Everything handed out by
    /// [`Arena::alloc_freeable`] since the last reclaim becomes invalid.
    pub fn reclaim_freeable(&self) {
        if let Some(mut store) = self.store.get() {
            store.low = store.start;
            self.store.set(Some(store));
        }
    }

    /// True when the gap between the two regions has shrunk below the
    /// low-memory watermark and an epoch flush is due.
    pub fn low_on_memory(&self) -> bool {
        match self.store.get() {
            Some(store) => remaining(&store) < self.low_memsize,
            None => true,
        }
    }

    /// One-shot latch for the out-of-memory diagnostic.
    pub fn take_oom_report(&self) -> bool {
        let first = !self.oom_reported.get();
        self.oom_reported.set(true);
        first
    }
}

fn remaining(store: &Memstore) -> usize {
    store.high as usize - store.low as usize
}

fn round_up(size: usize) -> usize {
    (size + 7) & !7
}

fn mmap_anon(size: usize) -> Option<Memstore> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return None;
    }
    let start = addr as *mut u8;
    Some(Memstore {
        start,
        low: start,
        high: unsafe { start.add(size) },
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let arena = Arena::new(64 * 1024, 4 * 1024);
        let a = arena.alloc(13).unwrap();
        let b = arena.alloc(13).unwrap();
        assert_eq!(a.as_ptr() as usize % 8, 0);
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert_eq!(a.as_ptr() as usize - b.as_ptr() as usize, 16);
    }

    #[test]
    fn freeable_memory_is_reclaimable() {
        let arena = Arena::new(64 * 1024, 4 * 1024);
        let first = arena.alloc_freeable(1024).unwrap();
        loop {
            if arena.alloc_freeable(1024).is_none() {
                break;
            }
        }
        arena.reclaim_freeable();
        let again = arena.alloc_freeable(1024).unwrap();
        assert_eq!(first.as_ptr(), again.as_ptr());
    }

    #[test]
    fn oversized_requests_get_their_own_mapping() {
        let arena = Arena::new(64 * 1024, 4 * 1024);
        let before = arena.store.get().unwrap();
        let big = arena.alloc(32 * 1024).unwrap();
        let after = arena.store.get().unwrap();
        assert_eq!(before.high, after.high);
        let big = big.as_ptr() as usize;
        assert!(big < before.start as usize || big >= before.start as usize + before.size);
    }

    #[test]
    fn non_freeable_exhaustion_rolls_to_a_fresh_memstore() {
        let arena = Arena::new(64 * 1024, 4 * 1024);
        let before = arena.store.get().unwrap().start;
        for _ in 0..200 {
            assert!(arena.alloc(1024).is_some());
        }
        let after = arena.store.get().unwrap().start;
        assert_ne!(before, after);
    }

    #[test]
    fn low_memory_watermark_trips() {
        let arena = Arena::new(64 * 1024, 60 * 1024);
        assert!(!arena.low_on_memory());
        while arena.alloc_freeable(4096).is_some() {}
        assert!(arena.low_on_memory());
    }

    #[test]
    fn oom_report_fires_once() {
        let arena = Arena::new(64 * 1024, 4 * 1024);
        assert!(arena.take_oom_report());
        assert!(!arena.take_oom_report());
    }
}
