//! Process-wide sampling statistics.
//!
//! Every abnormal disposition of a sample ends up here as a counter rather
//! than as an error that could disturb the interrupted thread. The whole
//! set is logged once at finalization.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    /// Samples whose paths were recorded in a CCT.
    pub samples_total: AtomicU64,
    /// Samples for which a handler ran at all.
    pub samples_attempted: AtomicU64,
    /// Dropped: handler re-entered while a sample was in flight.
    pub samples_blocked_async: AtomicU64,
    /// Dropped: the loadmap or recipe cache was contended.
    pub samples_blocked_dlopen: AtomicU64,
    /// Dropped: program counter inside the measurement runtime itself.
    pub samples_blocked_in_collector: AtomicU64,
    /// Dropped: thread suppressed, finalizing, or sampling stopped.
    pub samples_filtered: AtomicU64,
    /// Unwinds that aborted on a bad memory read.
    pub samples_segv: AtomicU64,
    /// Unwinds that ended without reaching a known bottom frame.
    pub samples_partial: AtomicU64,
    /// Unwinds that resorted to stack trolling at least once.
    pub samples_trolled: AtomicU64,
    /// Total frames recorded across all accepted samples.
    pub frames_total: AtomicU64,
    /// Unwind recipes built by binary analysis.
    pub unwind_recipes_total: AtomicU64,
    /// Recipes rejected because they would overlap a cached range.
    pub unwind_recipes_suspicious: AtomicU64,
    /// Arena allocation failures.
    pub oom_failures: AtomicU64,
    /// Trace records emitted.
    pub trace_records: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        for counter in self.all() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn all(&self) -> [&AtomicU64; 14] {
        [
            &self.samples_total,
            &self.samples_attempted,
            &self.samples_blocked_async,
            &self.samples_blocked_dlopen,
            &self.samples_blocked_in_collector,
            &self.samples_filtered,
            &self.samples_segv,
            &self.samples_partial,
            &self.samples_trolled,
            &self.frames_total,
            &self.unwind_recipes_total,
            &self.unwind_recipes_suspicious,
            &self.oom_failures,
            &self.trace_records,
        ]
    }

    pub fn log_summary(&self) {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        log::info!(
            "SUMMARY: samples: {} (recorded: {}, blocked async: {}, blocked dl: {}, \
             blocked in collector: {}, filtered: {}, segv: {})",
            get(&self.samples_attempted),
            get(&self.samples_total),
            get(&self.samples_blocked_async),
            get(&self.samples_blocked_dlopen),
            get(&self.samples_blocked_in_collector),
            get(&self.samples_filtered),
            get(&self.samples_segv),
        );
        log::info!(
            "SUMMARY: frames: {} (partial unwinds: {}, trolled: {})",
            get(&self.frames_total),
            get(&self.samples_partial),
            get(&self.samples_trolled),
        );
        log::info!(
            "SUMMARY: recipes built: {} (suspicious: {}), arena failures: {}, trace records: {}",
            get(&self.unwind_recipes_total),
            get(&self.unwind_recipes_suspicious),
            get(&self.oom_failures),
            get(&self.trace_records),
        );
    }
}

/// Relaxed increment; counters are advisory.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_counter() {
        let stats = Stats::new();
        inc(&stats.samples_total);
        add(&stats.frames_total, 17);
        stats.reset();
        assert_eq!(stats.samples_total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.frames_total.load(Ordering::Relaxed), 0);
    }
}
