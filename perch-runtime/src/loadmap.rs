//! The load map: an append-only registry of mapped code objects.
//!
//! Every code object the dynamic-link auditor reports gets a record with a
//! mapping-order id that is never recycled. Records survive `dlclose`: the
//! id and the address range stay valid so that historical samples keep
//! resolving, the record is merely marked unmapped. A generation counter,
//! bumped by every map and unmap, lets the epoch manager notice change.
//!
//! Writers only run inside audit callbacks, outside signal context.
//! Signal-context readers use `try_read`; if the lock is contended the
//! sample is dropped by the caller and counted, never blocked on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::ip::{ModuleId, NormalizedIp};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleFlags: u32 {
        /// Position-independent object; addresses need the load bias.
        const RELOCATABLE = 1 << 0;
        /// This object is the measurement runtime itself.
        const CONTAINS_RUNTIME = 1 << 1;
    }
}

/// Everything the analysis pass learns about an object before it is
/// registered: where it landed, how to translate addresses back into
/// file-relative offsets, and where its functions are.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    /// Difference between runtime addresses and file-relative addresses.
    pub bias: u64,
    /// Sorted, disjoint `[start, end)` function ranges, runtime addresses.
    pub func_bounds: Vec<(u64, u64)>,
    pub flags: ModuleFlags,
}

#[derive(Debug)]
pub struct Module {
    pub id: ModuleId,
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
    pub bias: u64,
    pub flags: ModuleFlags,
    func_bounds: Vec<(u64, u64)>,
    /// Loadmap generation at which this module was registered.
    pub created_gen: u64,
    mapped: AtomicBool,
    /// Guards recipe construction so only one thread analyzes a function
    /// of this module at a time.
    analysis_lock: AtomicBool,
    /// Number of recipe-cache entries derived from this module.
    pub recipe_entries: AtomicU32,
}

impl Module {
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// The `[start, end)` of the function enclosing `addr`, if known.
    pub fn enclosing_function(&self, addr: u64) -> Option<(u64, u64)> {
        let idx = match self.func_bounds.binary_search_by_key(&addr, |r| r.0) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let range = self.func_bounds[idx];
        (addr < range.1).then_some(range)
    }

    /// Non-blocking acquisition of the per-module analysis lock.
    pub fn try_lock_analysis(&self) -> bool {
        self.analysis_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock_analysis(&self) {
        self.analysis_lock.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct LoadMap {
    modules: RwLock<Vec<Arc<Module>>>,
    generation: AtomicU64,
}

impl LoadMap {
    pub fn new() -> LoadMap {
        LoadMap::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Registers a new code object. Audit-callback context only.
    pub fn on_map(&self, path: PathBuf, start: u64, end: u64, info: ModuleInfo) -> ModuleId {
        let mut modules = self.modules.write();
        assert!(
            modules.len() < ModuleId::PLACEHOLDER.0 as usize,
            "load module ids exhausted"
        );
        let id = ModuleId(modules.len() as u16);
        let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        modules.push(Arc::new(Module {
            id,
            path,
            start,
            end,
            bias: info.bias,
            flags: info.flags,
            func_bounds: info.func_bounds,
            created_gen: gen,
            mapped: AtomicBool::new(true),
            analysis_lock: AtomicBool::new(false),
            recipe_entries: AtomicU32::new(0),
        }));
        id
    }

    /// Marks a module unmapped; the record itself is retained.
    pub fn on_unmap(&self, id: ModuleId) {
        let modules = self.modules.read();
        if let Some(module) = modules.get(id.0 as usize) {
            module.mapped.store(false, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn find_by_id(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.modules.read().get(id.0 as usize).cloned()
    }

    /// Blocking address lookup, for use outside signal context.
    pub fn find_by_addr(&self, addr: u64) -> Option<Arc<Module>> {
        find_mapped(&self.modules.read(), addr)
    }

    /// Signal-safe address lookup. `None` means the loadmap was contended;
    /// the caller drops the sample rather than wait.
    pub fn try_find_by_addr(&self, addr: u64) -> Option<Option<Arc<Module>>> {
        let modules = self.modules.try_read()?;
        Some(find_mapped(&modules, addr))
    }

    pub fn normalize(&self, addr: u64) -> NormalizedIp {
        match self.find_by_addr(addr) {
            Some(module) => NormalizedIp::new(module.id, addr - module.bias),
            None => NormalizedIp::UNNORMALIZED,
        }
    }

    /// Signal-safe normalization; `None` means contended.
    pub fn try_normalize(&self, addr: u64) -> Option<NormalizedIp> {
        let module = self.try_find_by_addr(addr)?;
        Some(match module {
            Some(module) => NormalizedIp::new(module.id, addr - module.bias),
            None => NormalizedIp::UNNORMALIZED,
        })
    }

    pub fn denormalize(&self, ip: NormalizedIp) -> Option<u64> {
        if ip.module == ModuleId::PLACEHOLDER {
            return None;
        }
        let module = self.find_by_id(ip.module)?;
        Some(ip.offset + module.bias)
    }

    /// A stable snapshot of every module ever registered, in id order.
    pub fn iterate_stable(&self) -> Vec<Arc<Module>> {
        self.modules.read().clone()
    }

    /// The modules visible at `generation`, i.e. an epoch's load map.
    pub fn modules_created_through(&self, generation: u64) -> Vec<Arc<Module>> {
        self.modules
            .read()
            .iter()
            .filter(|m| m.created_gen <= generation)
            .cloned()
            .collect()
    }
}

fn find_mapped(modules: &[Arc<Module>], addr: u64) -> Option<Arc<Module>> {
    // Newest first: a fresh mapping may reuse the address range of an
    // unloaded one.
    modules
        .iter()
        .rev()
        .find(|m| m.is_mapped() && m.contains(addr))
        .cloned()
}
