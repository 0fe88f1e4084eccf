//! The previous-sample cache ("trampoline").
//!
//! The original trampoline idea patches a sentinel bit into a stored
//! return address so that returning through the previously sampled frame
//! runs a counting stub. Rewriting application stacks is an
//! architecture-specific optimization (see `unwind::arch::RA_MARK_BIT`);
//! what this module keeps is the semantic content: a handle to the
//! previous sample's path, so that
//!
//! * a sample whose call path is identical to the previous one reuses the
//!   previous leaf without re-walking the tree, and
//! * a sample that shares only a shorter prefix proves that control
//!   returned out of at least one sampled frame, which is what the
//!   return-count metric records.
//!
//! The cache is invalidated whenever a new epoch starts, because node
//! references do not cross CCTs.

use crate::arena::Arena;
use crate::backtrace::Frame;
use crate::cct::NodeRef;
use crate::ip::NormalizedIp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixMatch {
    /// Same path as the previous sample; reuse its leaf.
    Identical(NodeRef),
    /// Control returned out of `returned` previously sampled frames.
    Returned { returned: usize },
    /// Nothing cached or nothing shared.
    None,
}

#[derive(Debug)]
pub struct TrampolineCache {
    enabled: bool,
    valid: bool,
    /// Previous path, outermost first, in non-freeable arena memory.
    ips: *mut NormalizedIp,
    capacity: usize,
    len: usize,
    prev_leaf: NodeRef,
}

unsafe impl Send for TrampolineCache {}

impl TrampolineCache {
    pub fn new_in(arena: &Arena, capacity: usize, enabled: bool) -> Option<TrampolineCache> {
        let bytes = capacity.checked_mul(std::mem::size_of::<NormalizedIp>())?;
        let ips = arena.alloc(bytes)?.cast::<NormalizedIp>().as_ptr();
        Some(TrampolineCache {
            enabled,
            valid: false,
            ips,
            capacity,
            len: 0,
            prev_leaf: NodeRef::NULL,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.len = 0;
        self.prev_leaf = NodeRef::NULL;
    }

    /// Compares a fresh backtrace (innermost first) against the cached
    /// path.
    pub fn compare(&self, frames: &[Frame]) -> PrefixMatch {
        if !self.enabled || !self.valid || self.len == 0 {
            return PrefixMatch::None;
        }
        let prev = unsafe { std::slice::from_raw_parts(self.ips, self.len) };
        let mut shared = 0;
        while shared < prev.len() && shared < frames.len() {
            // prev is outermost first, frames innermost first.
            if prev[shared] != frames[frames.len() - 1 - shared].ip_norm {
                break;
            }
            shared += 1;
        }
        if shared == prev.len() && shared == frames.len() {
            PrefixMatch::Identical(self.prev_leaf)
        } else if shared < prev.len() {
            PrefixMatch::Returned {
                returned: prev.len() - shared,
            }
        } else {
            PrefixMatch::None
        }
    }

    /// Remembers the path just inserted (innermost first) and its leaf.
    pub fn record(&mut self, frames: &[Frame], leaf: NodeRef) {
        if !self.enabled || frames.len() > self.capacity {
            self.invalidate();
            return;
        }
        for (i, frame) in frames.iter().rev().enumerate() {
            unsafe { self.ips.add(i).write(frame.ip_norm) };
        }
        self.len = frames.len();
        self.prev_leaf = leaf;
        self.valid = true;
    }

    pub fn previous_leaf(&self) -> Option<NodeRef> {
        (self.valid && !self.prev_leaf.is_null()).then_some(self.prev_leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::ModuleId;

    fn frame(offset: u64) -> Frame {
        let ip = NormalizedIp::new(ModuleId(0), offset);
        Frame {
            ip_norm: ip,
            the_function: ip,
            ra_loc: 0,
            ra_val: 0,
        }
    }

    fn cache(enabled: bool) -> (Arena, TrampolineCache) {
        let arena = Arena::new(256 * 1024, 8 * 1024);
        let cache = TrampolineCache::new_in(&arena, 64, enabled).unwrap();
        (arena, cache)
    }

    #[test]
    fn identical_path_reuses_the_previous_leaf() {
        let (_arena, mut cache) = cache(true);
        let frames = [frame(0x30), frame(0x20), frame(0x10)];
        cache.record(&frames, NodeRef::NULL);
        // A real leaf would be non-null; use compare's result shape only.
        let frames2 = frames;
        match cache.compare(&frames2) {
            PrefixMatch::Identical(_) => {}
            other => panic!("expected Identical, got {other:?}"),
        }
    }

    #[test]
    fn shorter_shared_prefix_counts_returns() {
        let (_arena, mut cache) = cache(true);
        // Previous: a -> b -> c -> d (outermost a).
        let prev = [frame(0xd), frame(0xc), frame(0xb), frame(0xa)];
        cache.record(&prev, NodeRef::NULL);
        // Now: a -> b -> e; c and d have returned.
        let now = [frame(0xe), frame(0xb), frame(0xa)];
        assert_eq!(cache.compare(&now), PrefixMatch::Returned { returned: 2 });
    }

    #[test]
    fn deeper_path_with_shared_prefix_is_not_a_return() {
        let (_arena, mut cache) = cache(true);
        let prev = [frame(0xb), frame(0xa)];
        cache.record(&prev, NodeRef::NULL);
        let now = [frame(0xc), frame(0xb), frame(0xa)];
        assert_eq!(cache.compare(&now), PrefixMatch::None);
    }

    #[test]
    fn disabled_cache_never_matches() {
        let (_arena, mut cache) = cache(false);
        let frames = [frame(0x10)];
        cache.record(&frames, NodeRef::NULL);
        assert_eq!(cache.compare(&frames), PrefixMatch::None);
    }

    #[test]
    fn invalidation_clears_the_cache() {
        let (_arena, mut cache) = cache(true);
        let frames = [frame(0x10)];
        cache.record(&frames, NodeRef::NULL);
        cache.invalidate();
        assert_eq!(cache.compare(&frames), PrefixMatch::None);
    }
}
