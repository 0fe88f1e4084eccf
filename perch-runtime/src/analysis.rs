//! Binary analysis: module inspection and recipe construction.
//!
//! Two passes at two very different times:
//!
//! * [`inspect_module`] runs once per code object, from the audit callback
//!   (ordinary context, allocation allowed). It parses the ELF image to
//!   find the load bias and a sorted function-bounds table.
//! * [`analyze_function`] runs lazily from the unwind path on a recipe
//!   cache miss. It scans the mapped machine code of one function and
//!   partitions its range into recipes. It allocates nothing: results go
//!   into a fixed-size [`RecipeSet`].
//!
//! The scanner understands the common x86-64 prologue shapes (push rbp /
//! mov rbp,rsp / callee-saved pushes / sub rsp). Scanning stops at the
//! first instruction it does not recognize; the rest of the function gets
//! a single body recipe describing the state reached so far. Imprecision
//! here is tolerable: a wrong recipe surfaces as a failed validation and
//! the unwinder falls back to trolling.

use std::path::Path;

use memmap2::Mmap;
use object::{Object, ObjectKind, ObjectSegment, ObjectSymbol, SymbolKind};
use thiserror::Error;

use crate::ip::ModuleId;
use crate::loadmap::{ModuleFlags, ModuleInfo};
use crate::recipe::{Recipe, RecipeEntry};

/// Upper bound on recipes emitted for one function.
pub const MAX_RECIPES_PER_FUNCTION: usize = 8;

/// Prologues longer than this are not scanned instruction by instruction.
const PROLOGUE_SCAN_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum ModuleAnalysisError {
    #[error("cannot read module file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse module image: {0}")]
    Object(#[from] object::Error),
}

/// Parses the object file backing a mapped range and derives the
/// [`ModuleInfo`] the loadmap stores.
pub fn inspect_module(
    path: &Path,
    start: u64,
    end: u64,
) -> Result<ModuleInfo, ModuleAnalysisError> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let object = object::File::parse(&*mmap)?;

    let relocatable = object.kind() == ObjectKind::Dynamic;
    let bias = if relocatable {
        let min_vaddr = object
            .segments()
            .map(|seg| seg.address())
            .min()
            .unwrap_or(0);
        start - min_vaddr
    } else {
        0
    };

    let mut bounds: Vec<(u64, u64)> = object
        .symbols()
        .chain(object.dynamic_symbols())
        .filter(|sym| sym.kind() == SymbolKind::Text && sym.size() > 0)
        .map(|sym| {
            let lo = sym.address() + bias;
            (lo, lo + sym.size())
        })
        .filter(|&(lo, hi)| lo >= start && hi <= end)
        .collect();
    bounds.sort_unstable();
    bounds.dedup_by_key(|r| r.0);
    // Symbol tables occasionally carry overlapping sizes; clip each range
    // at its successor so the table stays disjoint.
    for i in 0..bounds.len().saturating_sub(1) {
        let next_start = bounds[i + 1].0;
        if bounds[i].1 > next_start {
            bounds[i].1 = next_start;
        }
    }

    let mut flags = ModuleFlags::empty();
    if relocatable {
        flags |= ModuleFlags::RELOCATABLE;
    }
    Ok(ModuleInfo {
        bias,
        func_bounds: bounds,
        flags,
    })
}

/// Recipes for one function, allocation-free.
#[derive(Debug, Clone, Copy)]
pub struct RecipeSet {
    entries: [RecipeEntry; MAX_RECIPES_PER_FUNCTION],
    len: usize,
}

impl RecipeSet {
    fn new() -> Self {
        RecipeSet {
            entries: [RecipeEntry {
                start: 0,
                end: 0,
                recipe: Recipe::Poison,
                module: ModuleId::PLACEHOLDER,
            }; MAX_RECIPES_PER_FUNCTION],
            len: 0,
        }
    }

    fn push(&mut self, entry: RecipeEntry) {
        if self.len < MAX_RECIPES_PER_FUNCTION && entry.start < entry.end {
            self.entries[self.len] = entry;
            self.len += 1;
        }
    }

    pub fn as_slice(&self) -> &[RecipeEntry] {
        &self.entries[..self.len]
    }

    /// The recipe whose range contains `vma`.
    pub fn recipe_for(&self, vma: u64) -> Option<RecipeEntry> {
        self.as_slice().iter().copied().find(|e| e.contains(vma))
    }
}

enum Insn {
    /// push of a callee-saved register; `to_rbp` when the register is rbp.
    Push { to_rbp: bool },
    /// mov rbp, rsp
    FrameSetup,
    /// sub rsp, imm
    SubSp(i32),
    Unknown,
}

fn decode(bytes: &[u8]) -> (usize, Insn) {
    match bytes {
        [0x55, ..] => (1, Insn::Push { to_rbp: true }),
        [0x53, ..] => (1, Insn::Push { to_rbp: false }),
        [0x41, reg, ..] if (0x50..=0x57).contains(reg) => (2, Insn::Push { to_rbp: false }),
        [0x48, 0x89, 0xe5, ..] => (3, Insn::FrameSetup),
        [0x48, 0x83, 0xec, imm, ..] => (4, Insn::SubSp(*imm as i8 as i32)),
        [0x48, 0x81, 0xec, a, b, c, d, ..] => {
            (7, Insn::SubSp(i32::from_le_bytes([*a, *b, *c, *d])))
        }
        _ => (0, Insn::Unknown),
    }
}

/// Scans the machine code of the function at `[start, start + bytes.len())`
/// and partitions its range into recipes.
pub fn analyze_function(bytes: &[u8], start: u64, module: ModuleId) -> RecipeSet {
    let end = start + bytes.len() as u64;
    let mut set = RecipeSet::new();
    if bytes.is_empty() {
        return set;
    }

    // State after the instructions executed so far: where the return
    // address and the caller's BP sit relative to the current SP.
    let mut ra_off: i32 = 0;
    let mut bp_at: Option<i32> = None;
    let mut framed = false;
    let mut seg_start = start;
    let mut pos = 0usize;

    let current = |ra_off: i32, bp_at: Option<i32>, framed: bool| -> Recipe {
        if framed {
            Recipe::BpFrame {
                bp_ra_off: 8,
                bp_bp_off: 0,
            }
        } else {
            Recipe::SpRelative {
                sp_ra_off: ra_off,
                sp_bp_off: bp_at,
            }
        }
    };

    while pos < bytes.len().min(PROLOGUE_SCAN_LIMIT) && set.len < MAX_RECIPES_PER_FUNCTION - 1 {
        let (len, insn) = decode(&bytes[pos..]);
        match insn {
            Insn::Push { to_rbp } => {
                set.push(RecipeEntry {
                    start: seg_start,
                    end: start + (pos + len) as u64,
                    recipe: current(ra_off, bp_at, framed),
                    module,
                });
                seg_start = start + (pos + len) as u64;
                ra_off += 8;
                bp_at = bp_at.map(|off| off + 8);
                if to_rbp {
                    bp_at = Some(0);
                }
            }
            Insn::SubSp(n) => {
                set.push(RecipeEntry {
                    start: seg_start,
                    end: start + (pos + len) as u64,
                    recipe: current(ra_off, bp_at, framed),
                    module,
                });
                seg_start = start + (pos + len) as u64;
                ra_off += n;
                bp_at = bp_at.map(|off| off + n);
            }
            Insn::FrameSetup => {
                set.push(RecipeEntry {
                    start: seg_start,
                    end: start + (pos + len) as u64,
                    recipe: current(ra_off, bp_at, framed),
                    module,
                });
                seg_start = start + (pos + len) as u64;
                framed = true;
                break;
            }
            Insn::Unknown => break,
        }
        pos += len;
    }

    if seg_start < end {
        set.push(RecipeEntry {
            start: seg_start,
            end,
            recipe: current(ra_off, bp_at, framed),
            module,
        });
    }
    set
}
