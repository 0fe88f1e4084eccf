//! Unwind recipes and the process-wide recipe cache.
//!
//! A recipe tells the unwinder how to recover the caller's state from the
//! callee's at any PC inside one function range. Recipes are produced by
//! binary analysis the first time an unwind lands in a function, then
//! cached for the lifetime of the owning module.
//!
//! The cache is an interval table over runtime addresses. Ranges are
//! half-open `[start, end)` and never overlap; a PC equal to a shared
//! boundary therefore resolves to the successor range, which describes the
//! prolog of the following function. Lookups from signal context must not
//! block, so both directions use `try_*` locking and treat contention as a
//! miss. The backing storage is reserved up front: inserting never calls
//! the system allocator.

use parking_lot::RwLock;

use crate::ip::ModuleId;

/// Default capacity of the process-wide cache, in entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 1 << 16;

/// The register holding the return address in a `RegisterRelative` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaReg {
    LinkRegister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipe {
    /// Canonical base-pointer chain: RA at `*(bp + 8)`, saved BP at `*bp`.
    StandardFrame,
    /// RA and (optionally) the saved BP sit at fixed offsets from SP.
    SpRelative {
        sp_ra_off: i32,
        sp_bp_off: Option<i32>,
    },
    /// RA is still in a register; typical of leaf frames and prologs.
    RegisterRelative { reg: RaReg },
    /// Like `StandardFrame` but with explicit offsets from BP.
    BpFrame { bp_ra_off: i32, bp_bp_off: i32 },
    /// Known-bad region; unwinding must not proceed from here.
    Poison,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipeEntry {
    pub start: u64,
    pub end: u64,
    pub recipe: Recipe,
    pub module: ModuleId,
}

impl RecipeEntry {
    pub fn contains(&self, vma: u64) -> bool {
        vma >= self.start && vma < self.end
    }
}

/// Outcome of a batch insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    /// Entries dropped because they would overlap a cached range.
    pub rejected: usize,
    /// The table lock was contended; nothing was inserted.
    pub contended: bool,
}

#[derive(Debug)]
pub struct RecipeCache {
    /// Sorted by `start`; capacity fixed at construction.
    table: RwLock<Vec<RecipeEntry>>,
    capacity: usize,
}

impl RecipeCache {
    pub fn new(capacity: usize) -> Self {
        RecipeCache {
            table: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Signal-safe lookup. `None` on miss or contention.
    pub fn lookup(&self, vma: u64) -> Option<RecipeEntry> {
        let table = self.table.try_read()?;
        let idx = match table.binary_search_by_key(&vma, |e| e.start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let entry = table[idx];
        entry.contains(vma).then_some(entry)
    }

    /// Inserts the entries that do not collide with cached ranges.
    ///
    /// Callers hold the owning module's analysis lock, so concurrent
    /// insertions for the same function do not occur; collisions can still
    /// arise from earlier partial analyses and are rejected entry by entry.
    pub fn insert_if_absent(&self, entries: &[RecipeEntry]) -> InsertOutcome {
        let mut outcome = InsertOutcome {
            inserted: 0,
            rejected: 0,
            contended: false,
        };
        let Some(mut table) = self.table.try_write() else {
            outcome.contended = true;
            return outcome;
        };
        for entry in entries {
            if entry.start >= entry.end {
                outcome.rejected += 1;
                continue;
            }
            if table.len() == self.capacity {
                outcome.rejected += entries.len() - outcome.inserted - outcome.rejected;
                break;
            }
            let idx = match table.binary_search_by_key(&entry.start, |e| e.start) {
                Ok(_) => {
                    outcome.rejected += 1;
                    continue;
                }
                Err(idx) => idx,
            };
            let clear_below = idx == 0 || table[idx - 1].end <= entry.start;
            let clear_above = idx == table.len() || entry.end <= table[idx].start;
            if clear_below && clear_above {
                table.insert(idx, *entry);
                outcome.inserted += 1;
            } else {
                outcome.rejected += 1;
            }
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the no-overlap invariant over the whole table.
    pub fn ranges_are_disjoint(&self) -> bool {
        let table = self.table.read();
        table.windows(2).all(|w| w[0].end <= w[1].start)
    }
}

impl Default for RecipeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u64, end: u64, recipe: Recipe) -> RecipeEntry {
        RecipeEntry {
            start,
            end,
            recipe,
            module: ModuleId(0),
        }
    }

    #[test]
    fn lookup_respects_half_open_ranges() {
        let cache = RecipeCache::new(16);
        let body = entry(0x1010, 0x1100, Recipe::StandardFrame);
        let prolog = entry(
            0x1100,
            0x1108,
            Recipe::SpRelative {
                sp_ra_off: 0,
                sp_bp_off: None,
            },
        );
        cache.insert_if_absent(&[body, prolog]);

        assert_eq!(cache.lookup(0x100f), None);
        assert_eq!(cache.lookup(0x1010), Some(body));
        assert_eq!(cache.lookup(0x10ff), Some(body));
        // A PC on a shared boundary belongs to the successor's prolog.
        assert_eq!(cache.lookup(0x1100), Some(prolog));
        assert_eq!(cache.lookup(0x1108), None);
    }

    #[test]
    fn overlapping_insertions_are_rejected() {
        let cache = RecipeCache::new(16);
        cache.insert_if_absent(&[entry(0x1000, 0x1100, Recipe::StandardFrame)]);
        let outcome = cache.insert_if_absent(&[
            entry(0x10f0, 0x1200, Recipe::Poison), // overlaps the tail
            entry(0x1100, 0x1180, Recipe::StandardFrame), // clean
        ]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.rejected, 1);
        assert!(cache.ranges_are_disjoint());
        assert_eq!(cache.lookup(0x10f8).unwrap().recipe, Recipe::StandardFrame);
    }

    #[test]
    fn insertion_stops_at_capacity() {
        let cache = RecipeCache::new(2);
        let outcome = cache.insert_if_absent(&[
            entry(0x1000, 0x1010, Recipe::StandardFrame),
            entry(0x1010, 0x1020, Recipe::StandardFrame),
            entry(0x1020, 0x1030, Recipe::StandardFrame),
        ]);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn empty_ranges_are_rejected() {
        let cache = RecipeCache::new(4);
        let outcome = cache.insert_if_absent(&[entry(0x1000, 0x1000, Recipe::StandardFrame)]);
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.rejected, 1);
    }
}
