//! The measurement context: every process-wide structure in one place.
//!
//! The loadmap, recipe cache, metric registry, ignore set, fence registry
//! and statistics are conceptually singletons, but they are owned by an
//! explicit context value that is created once at initialization and
//! re-created by the post-fork hook, never reached through scattered
//! globals. Entry points take the context; the signal handler finds it
//! through the thread descriptor installed at thread-init.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audit::LibcExports;
use crate::env::Config;
use crate::ignore::ModuleIgnoreMap;
use crate::loadmap::LoadMap;
use crate::metrics::MetricRegistry;
use crate::recipe::RecipeCache;
use crate::sources::idle::BlameState;
use crate::sources::SourceSet;
use crate::stats::Stats;
use crate::unwind::{FenceRegistry, Unwinder};

pub struct MeasurementContext {
    pub config: Config,
    pub loadmap: LoadMap,
    pub recipes: RecipeCache,
    pub metrics: MetricRegistry,
    pub ignore: ModuleIgnoreMap,
    pub fences: FenceRegistry,
    pub stats: Stats,
    pub sources: Mutex<SourceSet>,
    /// Idle/work blame-shift bookkeeping (lock-free, signal-safe).
    pub blame: BlameState,
    /// Process-wide start/stop switch (the start-stop API).
    pub sampling_active: AtomicBool,
    /// Lost the process-fraction draw: run the target, record nothing.
    pub recording: bool,
    /// Finalization has begun; handlers drop everything.
    pub finalizing: AtomicBool,
    pub libc_exports: Mutex<Option<LibcExports>>,
    /// Metric id of the trampoline return counter; `u32::MAX` = unset.
    /// Atomic because the sample path reads it lock-free.
    retcnt_metric: AtomicU32,
    thread_counter: AtomicU32,
}

impl MeasurementContext {
    pub fn new(config: Config) -> Arc<MeasurementContext> {
        let recording =
            config.process_fraction >= 1.0 || rand::random::<f64>() < config.process_fraction;
        let sampling_active = !config.delay_sampling;
        Arc::new(MeasurementContext {
            config,
            loadmap: LoadMap::new(),
            recipes: RecipeCache::default(),
            metrics: MetricRegistry::new(),
            ignore: ModuleIgnoreMap::new(),
            fences: FenceRegistry::new(),
            stats: Stats::new(),
            sources: Mutex::new(SourceSet::new()),
            blame: BlameState::default(),
            sampling_active: AtomicBool::new(sampling_active),
            recording,
            finalizing: AtomicBool::new(false),
            libc_exports: Mutex::new(None),
            retcnt_metric: AtomicU32::new(u32::MAX),
            thread_counter: AtomicU32::new(0),
        })
    }

    pub fn set_retcnt_metric(&self, metric: crate::metrics::MetricId) {
        self.retcnt_metric.store(metric.0 as u32, Ordering::Release);
    }

    pub fn retcnt_metric(&self) -> Option<crate::metrics::MetricId> {
        match self.retcnt_metric.load(Ordering::Acquire) {
            u32::MAX => None,
            id => Some(crate::metrics::MetricId(id as u16)),
        }
    }

    /// Ordinals are assigned in thread-creation order, starting at 0.
    pub fn next_thread_ordinal(&self) -> u32 {
        self.thread_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub fn unwinder(&self) -> Unwinder<'_> {
        Unwinder::new(&self.loadmap, &self.recipes, &self.fences, &self.stats)
    }
}

static CONTEXT: Mutex<Option<Arc<MeasurementContext>>> = Mutex::new(None);

/// Installs the process context. Fails if one is already installed.
pub fn install(ctx: Arc<MeasurementContext>) -> bool {
    let mut slot = CONTEXT.lock();
    if slot.is_some() {
        return false;
    }
    *slot = Some(ctx);
    true
}

/// Replaces the context unconditionally (post-fork re-initialization).
pub fn reinstall(ctx: Arc<MeasurementContext>) {
    *CONTEXT.lock() = Some(ctx);
}

pub fn current() -> Option<Arc<MeasurementContext>> {
    CONTEXT.lock().clone()
}
