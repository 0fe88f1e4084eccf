//! Normalized instruction pointers.
//!
//! A raw runtime address is only meaningful while the process that produced
//! it is alive and its libraries sit at the same base addresses. A
//! `NormalizedIp` expresses the same location as a (load module id, offset
//! within the module) pair, which stays comparable across relocation and
//! process restarts. Frames that do not correspond to program code (partial
//! unwinds, idle placeholders, …) use the placeholder module id with an
//! enumerated offset.

/// Identifier of a load module. Assigned in mapping order, never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u16);

impl ModuleId {
    /// The sentinel module that owns all placeholder frames.
    pub const PLACEHOLDER: ModuleId = ModuleId(u16::MAX);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalizedIp {
    pub module: ModuleId,
    pub offset: u64,
}

impl NormalizedIp {
    /// An address no load module covers.
    pub const UNNORMALIZED: NormalizedIp = NormalizedIp::placeholder(0);
    /// Root of samples whose unwind did not reach a known bottom frame.
    pub const PARTIAL_UNWIND: NormalizedIp = NormalizedIp::placeholder(1);
    /// Root of samples whose module vanished before resolution.
    pub const UNRESOLVED: NormalizedIp = NormalizedIp::placeholder(2);
    /// The synthetic process root.
    pub const PROCESS_ROOT: NormalizedIp = NormalizedIp::placeholder(3);
    /// The synthetic per-thread root.
    pub const THREAD_ROOT: NormalizedIp = NormalizedIp::placeholder(4);
    /// Placeholder leaf for threads with no observed activity.
    pub const NO_ACTIVITY: NormalizedIp = NormalizedIp::placeholder(5);
    /// Placeholder leaf credited by the idle blame-shift source.
    pub const IDLE: NormalizedIp = NormalizedIp::placeholder(6);

    pub const fn new(module: ModuleId, offset: u64) -> Self {
        NormalizedIp { module, offset }
    }

    const fn placeholder(offset: u64) -> Self {
        NormalizedIp {
            module: ModuleId::PLACEHOLDER,
            offset,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.module == ModuleId::PLACEHOLDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_distinct() {
        let all = [
            NormalizedIp::UNNORMALIZED,
            NormalizedIp::PARTIAL_UNWIND,
            NormalizedIp::UNRESOLVED,
            NormalizedIp::PROCESS_ROOT,
            NormalizedIp::THREAD_ROOT,
            NormalizedIp::NO_ACTIVITY,
            NormalizedIp::IDLE,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_placeholder());
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn ordering_is_module_then_offset() {
        let a = NormalizedIp::new(ModuleId(1), 0x900);
        let b = NormalizedIp::new(ModuleId(2), 0x100);
        assert!(a < b);
    }
}
