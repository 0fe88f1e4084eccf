//! Address ranges of the measurement runtime itself.
//!
//! A sample whose interrupted program counter lies inside the collector's
//! own code must be dropped: unwinding through our own frames would charge
//! measurement overhead to the application. The set is tiny (the runtime
//! library plus whatever the auditor flags), written only during
//! registration, and probed from signal context with `try_read`.

use parking_lot::RwLock;

use crate::ip::ModuleId;

#[derive(Debug, Default)]
pub struct ModuleIgnoreMap {
    ranges: RwLock<Vec<(u64, u64, ModuleId)>>,
}

impl ModuleIgnoreMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, start: u64, end: u64, id: ModuleId) {
        self.ranges.write().push((start, end, id));
    }

    pub fn remove(&self, id: ModuleId) {
        self.ranges.write().retain(|&(_, _, m)| m != id);
    }

    /// Signal-safe containment probe. Contention reports "ignored": the
    /// map only changes while the auditor is rewriting the loadmap, and a
    /// sample taken at that moment is dropped anyway.
    pub fn contains(&self, addr: u64) -> bool {
        match self.ranges.try_read() {
            Some(ranges) => ranges.iter().any(|&(s, e, _)| addr >= s && addr < e),
            None => true,
        }
    }

    pub fn contains_id(&self, id: ModuleId) -> bool {
        self.ranges.read().iter().any(|&(_, _, m)| m == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_ranges() {
        let map = ModuleIgnoreMap::new();
        map.insert(0x7000, 0x8000, ModuleId(3));
        assert!(map.contains(0x7000));
        assert!(map.contains(0x7fff));
        assert!(!map.contains(0x8000));
        assert!(map.contains_id(ModuleId(3)));
        map.remove(ModuleId(3));
        assert!(!map.contains(0x7000));
    }
}
