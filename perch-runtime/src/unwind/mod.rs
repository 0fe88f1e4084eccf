//! The native stack unwinder.
//!
//! A cursor starts from the interrupted thread's register snapshot and is
//! stepped outward one frame at a time, driven by the recipes the binary
//! analyzer derives for each function range. Every memory access on this
//! path goes through [`AddressSpace`], which bounds-checks and returns
//! `Result`: a bad read never faults, it aborts the walk and the partial
//! prefix is attached to the partial-unwind root by the caller.
//!
//! When no recipe can be found for a PC, the walker degrades to stack
//! trolling: a bounded linear scan of stack slots for a value that points
//! into a known function.

pub mod arch;

use parking_lot::RwLock;

use crate::analysis;
use crate::ip::NormalizedIp;
use crate::loadmap::LoadMap;
use crate::recipe::{RaReg, Recipe, RecipeCache, RecipeEntry};
use crate::stats::{self, add, Stats};

/// Stack slots scanned by the trolling fallback.
pub const TROLL_LIMIT: usize = 16;

/// Which known boundary a cursor has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fence {
    #[default]
    None,
    ProcessBottom,
    ThreadBottom,
    Trampoline,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Ok,
    Stop,
    StopWeak,
    Troll,
    Error,
}

/// Why a walk aborted before reaching a bottom fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindAbort {
    /// A stack or code read failed the bounds check.
    Faulted,
    /// A step did not move the cursor strictly outward.
    NoProgress,
    /// No recipe and trolling found nothing plausible.
    NoRecipe,
    /// The loadmap or recipe cache was contended.
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault;

/// The sampled thread's view of memory, with every read checked.
pub trait AddressSpace {
    /// Reads one stack slot. Fails outside the thread's stack bounds.
    fn read_stack(&self, addr: u64) -> Result<u64, MemoryFault>;

    /// Machine code of `[start, start + len)`, if that range is readable
    /// mapped code.
    fn code_bytes(&self, start: u64, len: usize) -> Option<&[u8]>;

    /// Upper bound of the thread's stack; walking past it means the walk
    /// is done even without a fence.
    fn stack_top(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterSnapshot {
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,
    /// Link-register value, on architectures that have one.
    pub lr: Option<u64>,
}

/// Known process-bottom and thread-bottom function ranges, registered by
/// the lifecycle collaborator.
#[derive(Debug, Default)]
pub struct FenceRegistry {
    ranges: RwLock<Vec<(u64, u64, Fence)>>,
}

impl FenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_process_bottom(&self, start: u64, end: u64) {
        self.ranges.write().push((start, end, Fence::ProcessBottom));
    }

    pub fn register_thread_bottom(&self, start: u64, end: u64) {
        self.ranges.write().push((start, end, Fence::ThreadBottom));
    }

    /// Signal-safe; contention reports no fence, which at worst turns a
    /// stopped walk into a partial one.
    pub fn fence_for(&self, pc: u64) -> Fence {
        match self.ranges.try_read() {
            Some(ranges) => ranges
                .iter()
                .find(|&&(s, e, _)| pc >= s && pc < e)
                .map(|&(_, _, f)| f)
                .unwrap_or(Fence::None),
            None => Fence::None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,
    /// The return-address value that produced `pc` (0 for the leaf).
    pub ra: u64,
    /// Stack address the return address was read from (0 = register).
    pub ra_loc: u64,
    pub pc_norm: NormalizedIp,
    /// Normalized entry address of the enclosing function.
    pub the_function: NormalizedIp,
    pub recipe: Option<RecipeEntry>,
    pub fence: Fence,
    pub abort: Option<UnwindAbort>,
    is_leaf: bool,
    prev_was_register_relative: bool,
}

pub struct Unwinder<'a> {
    loadmap: &'a LoadMap,
    recipes: &'a RecipeCache,
    fences: &'a FenceRegistry,
    stats: &'a Stats,
}

impl<'a> Unwinder<'a> {
    pub fn new(
        loadmap: &'a LoadMap,
        recipes: &'a RecipeCache,
        fences: &'a FenceRegistry,
        stats: &'a Stats,
    ) -> Self {
        Unwinder {
            loadmap,
            recipes,
            fences,
            stats,
        }
    }

    /// Builds the innermost cursor from an interrupted register snapshot.
    pub fn init_cursor(
        &self,
        regs: &RegisterSnapshot,
        mem: &dyn AddressSpace,
    ) -> Result<Cursor, UnwindAbort> {
        let pc_norm = self
            .loadmap
            .try_normalize(regs.pc)
            .ok_or(UnwindAbort::Contended)?;
        let recipe = self.resolve_recipe(regs.pc, mem);
        let ra = match recipe.map(|e| e.recipe) {
            Some(Recipe::RegisterRelative {
                reg: RaReg::LinkRegister,
            }) => regs.lr.unwrap_or(0),
            _ => 0,
        };
        Ok(Cursor {
            pc: regs.pc,
            sp: regs.sp,
            bp: regs.bp,
            ra,
            ra_loc: 0,
            pc_norm,
            the_function: self.function_norm(regs.pc).unwrap_or(pc_norm),
            recipe,
            fence: Fence::None,
            abort: None,
            is_leaf: true,
            prev_was_register_relative: false,
        })
    }

    /// Advances the cursor one frame outward.
    pub fn step(&self, cursor: &mut Cursor, mem: &dyn AddressSpace) -> StepResult {
        match self.fences.fence_for(cursor.pc) {
            Fence::None => {}
            fence => {
                cursor.fence = fence;
                return StepResult::Stop;
            }
        }

        let troll_base = cursor.sp;
        let (ra, ra_loc, sp_next, bp_next) = match cursor.recipe.map(|e| e.recipe) {
            None => return self.troll(cursor, mem, troll_base),
            Some(Recipe::Poison) => return self.abort(cursor, UnwindAbort::NoRecipe),
            Some(Recipe::RegisterRelative { .. }) => {
                if cursor.prev_was_register_relative {
                    // Two SP-equal register steps cannot make progress.
                    return self.abort(cursor, UnwindAbort::NoProgress);
                }
                (cursor.ra, 0, cursor.sp, cursor.bp)
            }
            Some(Recipe::SpRelative {
                sp_ra_off,
                sp_bp_off,
            }) => {
                let ra_loc = offset(cursor.sp, sp_ra_off);
                let ra = match mem.read_stack(ra_loc) {
                    Ok(ra) => ra,
                    Err(_) => return self.abort(cursor, UnwindAbort::Faulted),
                };
                let bp = match sp_bp_off {
                    Some(off) => match mem.read_stack(offset(cursor.sp, off)) {
                        Ok(bp) => bp,
                        Err(_) => return self.abort(cursor, UnwindAbort::Faulted),
                    },
                    None => cursor.bp,
                };
                let sp_next = offset(cursor.sp, sp_ra_off) + 8;
                if sp_next <= cursor.sp {
                    return self.abort(cursor, UnwindAbort::NoProgress);
                }
                (ra, ra_loc, sp_next, bp)
            }
            Some(Recipe::StandardFrame) => {
                match self.bp_chain_step(cursor, mem, 8, 0) {
                    Ok(step) => step,
                    Err(abort) => return self.abort(cursor, abort),
                }
            }
            Some(Recipe::BpFrame {
                bp_ra_off,
                bp_bp_off,
            }) => match self.bp_chain_step(cursor, mem, bp_ra_off, bp_bp_off) {
                Ok(step) => step,
                Err(abort) => return self.abort(cursor, abort),
            },
        };

        if ra == 0 {
            // A zeroed return address is the conventional outermost frame.
            return StepResult::StopWeak;
        }
        if arch::ra_is_marked(ra) {
            cursor.fence = Fence::Trampoline;
            return StepResult::Stop;
        }

        let mut ra = ra;
        let mut sp_next = sp_next;
        let mut ra_loc = ra_loc;
        let mut pc = ra.wrapping_sub(arch::RA_DECREMENT);
        let mut recipe = self.resolve_recipe(pc, mem);

        if recipe.is_none() && cursor.is_leaf {
            // Skip-frame heuristic: an interrupted prolog or a tail call
            // can leave the true return address one slot further out.
            if let Ok(ra2) = mem.read_stack(sp_next) {
                if ra2 != 0 {
                    let pc2 = ra2.wrapping_sub(arch::RA_DECREMENT);
                    if let Some(found) = self.resolve_recipe(pc2, mem) {
                        ra = ra2;
                        ra_loc = sp_next;
                        sp_next += 8;
                        pc = pc2;
                        recipe = Some(found);
                    }
                }
            }
        }

        if recipe.is_none() && self.function_norm(pc).is_none() {
            return self.troll(cursor, mem, sp_next);
        }

        let was_register_relative = matches!(
            cursor.recipe.map(|e| e.recipe),
            Some(Recipe::RegisterRelative { .. })
        );
        if !self.advance(cursor, pc, sp_next, bp_next, ra, ra_loc, recipe) {
            return self.abort(cursor, UnwindAbort::Contended);
        }
        cursor.prev_was_register_relative = was_register_relative;

        if cursor.sp > mem.stack_top() {
            return StepResult::StopWeak;
        }
        StepResult::Ok
    }

    fn bp_chain_step(
        &self,
        cursor: &Cursor,
        mem: &dyn AddressSpace,
        bp_ra_off: i32,
        bp_bp_off: i32,
    ) -> Result<(u64, u64, u64, u64), UnwindAbort> {
        if cursor.bp < cursor.sp {
            // The frame pointer is not pointing into this frame; the
            // chain is broken.
            return Err(UnwindAbort::NoProgress);
        }
        let ra_loc = offset(cursor.bp, bp_ra_off);
        let ra = mem.read_stack(ra_loc).map_err(|_| UnwindAbort::Faulted)?;
        let bp_next = mem
            .read_stack(offset(cursor.bp, bp_bp_off))
            .map_err(|_| UnwindAbort::Faulted)?;
        let sp_next = ra_loc + 8;
        if sp_next <= cursor.sp {
            return Err(UnwindAbort::NoProgress);
        }
        Ok((ra, ra_loc, sp_next, bp_next))
    }

    /// Linear scan of up to [`TROLL_LIMIT`] slots above `from_sp` for a
    /// value that points into a known function.
    fn troll(&self, cursor: &mut Cursor, mem: &dyn AddressSpace, from_sp: u64) -> StepResult {
        for slot in 0..TROLL_LIMIT as u64 {
            let addr = from_sp + slot * 8;
            let Ok(value) = mem.read_stack(addr) else {
                break;
            };
            if value == 0 || arch::ra_is_marked(value) {
                continue;
            }
            let pc = value.wrapping_sub(arch::RA_DECREMENT);
            if self.function_norm(pc).is_none() {
                continue;
            }
            let recipe = self.resolve_recipe(pc, mem);
            let bp = cursor.bp;
            let was_register_relative = matches!(
                cursor.recipe.map(|e| e.recipe),
                Some(Recipe::RegisterRelative { .. })
            );
            if !self.advance(cursor, pc, addr + 8, bp, value, addr, recipe) {
                return self.abort(cursor, UnwindAbort::Contended);
            }
            cursor.prev_was_register_relative = was_register_relative;
            return StepResult::Troll;
        }
        self.abort(cursor, UnwindAbort::NoRecipe)
    }

    /// Commits a step. Returns false if normalization was contended.
    #[allow(clippy::too_many_arguments)]
    fn advance(
        &self,
        cursor: &mut Cursor,
        pc: u64,
        sp: u64,
        bp: u64,
        ra: u64,
        ra_loc: u64,
        recipe: Option<RecipeEntry>,
    ) -> bool {
        let Some(pc_norm) = self.loadmap.try_normalize(pc) else {
            return false;
        };
        cursor.pc = pc;
        cursor.sp = sp;
        cursor.bp = bp;
        // The recovered RA is only forwarded when the next frame expects
        // it in a register; elsewhere it is recomputed from the recipe.
        cursor.ra = match recipe.map(|e| e.recipe) {
            Some(Recipe::RegisterRelative { .. }) => 0,
            _ => ra,
        };
        cursor.ra_loc = ra_loc;
        cursor.pc_norm = pc_norm;
        cursor.the_function = self.function_norm(pc).unwrap_or(pc_norm);
        cursor.recipe = recipe;
        cursor.is_leaf = false;
        true
    }

    fn abort(&self, cursor: &mut Cursor, abort: UnwindAbort) -> StepResult {
        cursor.fence = Fence::Error;
        cursor.abort = Some(abort);
        StepResult::Error
    }

    /// Normalized entry address of the function enclosing `pc`.
    fn function_norm(&self, pc: u64) -> Option<NormalizedIp> {
        let module = self.loadmap.try_find_by_addr(pc)??;
        let (func_start, _) = module.enclosing_function(pc)?;
        Some(NormalizedIp::new(module.id, func_start - module.bias))
    }

    /// Finds or lazily builds the recipe covering `pc`.
    fn resolve_recipe(&self, pc: u64, mem: &dyn AddressSpace) -> Option<RecipeEntry> {
        if let Some(entry) = self.recipes.lookup(pc) {
            return Some(entry);
        }
        let module = self.loadmap.try_find_by_addr(pc)??;
        let (func_start, func_end) = module.enclosing_function(pc)?;
        let bytes = mem.code_bytes(func_start, (func_end - func_start) as usize)?;
        let set = analysis::analyze_function(bytes, func_start, module.id);

        // Only the analysis-lock holder publishes, so two threads never
        // race to insert the same function's recipes; everyone else still
        // uses the locally built set.
        if module.try_lock_analysis() {
            let outcome = self.recipes.insert_if_absent(set.as_slice());
            add(&self.stats.unwind_recipes_total, outcome.inserted as u64);
            add(
                &self.stats.unwind_recipes_suspicious,
                outcome.rejected as u64,
            );
            module
                .recipe_entries
                .fetch_add(outcome.inserted as u32, std::sync::atomic::Ordering::Relaxed);
            module.unlock_analysis();
        }
        let entry = set.recipe_for(pc)?;
        if entry.recipe == Recipe::Poison {
            stats::inc(&self.stats.unwind_recipes_suspicious);
        }
        Some(entry)
    }
}

fn offset(base: u64, off: i32) -> u64 {
    if off >= 0 {
        base + off as u64
    } else {
        base - (-off) as u64
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::ip::ModuleId;
    use crate::recipe::DEFAULT_CACHE_CAPACITY;

    struct Fixture {
        loadmap: LoadMap,
        recipes: RecipeCache,
        fences: FenceRegistry,
        stats: Stats,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                loadmap: LoadMap::new(),
                recipes: RecipeCache::new(DEFAULT_CACHE_CAPACITY),
                fences: FenceRegistry::new(),
                stats: Stats::new(),
            }
        }

        fn unwinder(&self) -> Unwinder<'_> {
            Unwinder::new(&self.loadmap, &self.recipes, &self.fences, &self.stats)
        }
    }

    /// Lays out three functions (main, f, g) with standard prologues and a
    /// stack holding two full frames below main.
    ///
    /// Code: main at 0x1000, f at 0x1100, g at 0x1200, each 0x80 long.
    /// The interrupted PC is in g's body.
    fn standard_fixture() -> (Fixture, SyntheticSpace, RegisterSnapshot) {
        let fx = Fixture::new();
        fx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            plain_module_info(0x1000, vec![(0x1000, 0x1080), (0x1100, 0x1180), (0x1200, 0x1280)]),
        );
        fx.fences.register_process_bottom(0x1000, 0x1080);

        let mut mem = SyntheticSpace::with_stack(0x7000, vec![0; 64]);
        let prologue = |body: usize| {
            let mut code = vec![0x55, 0x48, 0x89, 0xe5];
            code.extend(vec![0x90; body]);
            code
        };
        mem.add_code(0x1000, prologue(0x7c));
        mem.add_code(0x1100, prologue(0x7c));
        mem.add_code(0x1200, prologue(0x7c));

        // Frame layout (addresses grow upward):
        //   slot 0..1   g locals
        //   slot 2      saved bp of f   <- g's bp
        //   slot 3      RA into f (0x1140)
        //   slot 4..5   f locals
        //   slot 6      saved bp of main <- f's bp
        //   slot 7      RA into main (0x1040)
        //   slot 8..    main frame
        let g_bp = 0x7000 + 2 * 8;
        let f_bp = 0x7000 + 6 * 8;
        mem.stack[2] = f_bp;
        mem.stack[3] = 0x1140;
        mem.stack[6] = 0x7000 + 10 * 8; // main's saved bp, unused
        mem.stack[7] = 0x1040;

        let regs = RegisterSnapshot {
            pc: 0x1240,
            sp: 0x7000,
            bp: g_bp,
            lr: None,
        };
        (fx, mem, regs)
    }

    #[test]
    fn walks_a_standard_frame_chain_to_the_process_bottom() {
        let (fx, mem, regs) = standard_fixture();
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        assert_eq!(cursor.pc_norm, NormalizedIp::new(ModuleId(0), 0x240));

        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Ok);
        assert_eq!(cursor.pc, 0x1140 - 1);
        assert_eq!(cursor.pc_norm, NormalizedIp::new(ModuleId(0), 0x13f));
        assert_eq!(cursor.ra_loc, 0x7000 + 3 * 8);

        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Ok);
        assert_eq!(cursor.pc, 0x1040 - 1);

        // The next step recognizes main as the process bottom.
        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Stop);
        assert_eq!(cursor.fence, Fence::ProcessBottom);
    }

    #[test]
    fn sp_strictly_increases_across_ok_steps() {
        let (fx, mem, regs) = standard_fixture();
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        let mut last_sp = cursor.sp;
        loop {
            match unwinder.step(&mut cursor, &mem) {
                StepResult::Ok | StepResult::Troll => {
                    assert!(cursor.sp > last_sp, "sp must move strictly outward");
                    last_sp = cursor.sp;
                }
                _ => break,
            }
        }
    }

    #[test]
    fn unreadable_stack_aborts_with_a_fault() {
        let (fx, mut mem, regs) = standard_fixture();
        // Truncate the stack so f's frame is out of bounds.
        mem.stack.truncate(4);
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Ok);
        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Error);
        assert_eq!(cursor.abort, Some(UnwindAbort::Faulted));
        assert_eq!(cursor.fence, Fence::Error);
    }

    #[test]
    fn trolling_recovers_a_plausible_return_address() {
        let fx = Fixture::new();
        fx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            plain_module_info(0x1000, vec![(0x1100, 0x1180)]),
        );
        // PC without function bounds: no recipe, troll kicks in. Slot 2
        // holds garbage, slot 3 a credible return address into 0x1100.
        let mut mem = SyntheticSpace::with_stack(0x7000, vec![0, 0xbad, 0xbad, 0x1140, 0, 0]);
        mem.add_code(0x1100, vec![0x90; 0x80]);
        let regs = RegisterSnapshot {
            pc: 0x1090, // inside the module, outside any known function
            sp: 0x7000,
            bp: 0,
            lr: None,
        };
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        assert!(cursor.recipe.is_none());
        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Troll);
        assert_eq!(cursor.pc, 0x1140 - 1);
        assert_eq!(cursor.sp, mem.slot_addr(4));
    }

    #[test]
    fn troll_failure_is_an_error() {
        let fx = Fixture::new();
        fx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            plain_module_info(0x1000, vec![]),
        );
        let mem = SyntheticSpace::with_stack(0x7000, vec![0xbad; 32]);
        let regs = RegisterSnapshot {
            pc: 0x1040,
            sp: 0x7000,
            bp: 0,
            lr: None,
        };
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::Error);
        assert_eq!(cursor.abort, Some(UnwindAbort::NoRecipe));
    }

    #[test]
    fn zero_return_address_ends_the_walk_weakly() {
        let fx = Fixture::new();
        fx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            plain_module_info(0x1000, vec![(0x1100, 0x1180)]),
        );
        let mut mem = SyntheticSpace::with_stack(0x7000, vec![0; 8]);
        mem.add_code(0x1100, vec![0x90; 0x80]); // frameless body
        let regs = RegisterSnapshot {
            pc: 0x1140,
            sp: 0x7000,
            bp: 0,
            lr: None,
        };
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        assert_eq!(unwinder.step(&mut cursor, &mem), StepResult::StopWeak);
    }

    #[test]
    fn skip_frame_heuristic_applies_only_to_the_leaf() {
        let fx = Fixture::new();
        fx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            plain_module_info(0x1000, vec![(0x1100, 0x1180)]),
        );
        // Slot 0 holds a value that resolves nowhere; slot 1 holds a real
        // return address. The leaf skip reads one slot further out.
        let mut mem = SyntheticSpace::with_stack(0x7000, vec![0x5555, 0x1140, 0, 0]);
        mem.add_code(0x1100, vec![0x90; 0x80]);
        let regs = RegisterSnapshot {
            pc: 0x1120,
            sp: 0x7000,
            bp: 0,
            lr: None,
        };
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        let result = unwinder.step(&mut cursor, &mem);
        assert_eq!(result, StepResult::Ok);
        assert_eq!(cursor.pc, 0x1140 - 1);
        assert_eq!(cursor.ra_loc, mem.slot_addr(1));
    }

    #[test]
    fn recipe_cache_fills_lazily_and_stays_disjoint() {
        let (fx, mem, regs) = standard_fixture();
        assert!(fx.recipes.is_empty());
        let unwinder = fx.unwinder();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        while unwinder.step(&mut cursor, &mem) == StepResult::Ok {}
        assert!(!fx.recipes.is_empty());
        assert!(fx.recipes.ranges_are_disjoint());
        // Re-walking hits the cache; entry count must not change.
        let len = fx.recipes.len();
        let mut cursor = unwinder.init_cursor(&regs, &mem).unwrap();
        while unwinder.step(&mut cursor, &mem) == StepResult::Ok {}
        assert_eq!(fx.recipes.len(), len);
    }
}
