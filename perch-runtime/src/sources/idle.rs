//! The idle/work blame-shift source.
//!
//! Time a thread spends idle is nobody's fault at the idle thread's own
//! call path; the cause is whatever the working threads are doing. The
//! context keeps idle/working thread counts (adjusted by the threading
//! layer through synchronous events), and every asynchronous sample taken
//! on a working thread is additionally charged `idle / working` to an
//! IDLE metric at its leaf, apportioning the blame for the idle threads
//! across the code that is keeping them waiting.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::context::MeasurementContext;
use crate::error::MeasureError;
use crate::events::EventSpec;
use crate::metrics::{MetricFlags, MetricId};

/// Lock-free blame bookkeeping, owned by the measurement context so the
/// sample path can read it without locks.
#[derive(Debug)]
pub struct BlameState {
    idle: AtomicU64,
    working: AtomicU64,
    /// IDLE metric id; `u32::MAX` while blame shifting is unarmed.
    metric: AtomicU32,
}

impl Default for BlameState {
    fn default() -> Self {
        BlameState {
            idle: AtomicU64::new(0),
            working: AtomicU64::new(0),
            metric: AtomicU32::new(u32::MAX),
        }
    }
}

impl BlameState {
    pub fn thread_starts_working(&self) {
        self.working.fetch_add(1, Ordering::AcqRel);
    }

    pub fn thread_becomes_idle(&self) {
        self.working.fetch_sub(1, Ordering::AcqRel);
        self.idle.fetch_add(1, Ordering::AcqRel);
    }

    pub fn thread_resumes_work(&self) {
        self.idle.fetch_sub(1, Ordering::AcqRel);
        self.working.fetch_add(1, Ordering::AcqRel);
    }

    /// The extra (metric, increment) a working thread's sample should
    /// carry, if blame shifting is armed and someone is actually idle.
    pub fn adjustment(&self) -> Option<(MetricId, f64)> {
        let metric = self.metric.load(Ordering::Acquire);
        if metric == u32::MAX {
            return None;
        }
        let idle = self.idle.load(Ordering::Acquire);
        let working = self.working.load(Ordering::Acquire);
        if idle == 0 || working == 0 {
            return None;
        }
        Some((MetricId(metric as u16), idle as f64 / working as f64))
    }
}

#[derive(Debug, Default)]
pub struct IdleBlameSource {
    metric: Option<MetricId>,
}

impl IdleBlameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports_event(&self, spec: &EventSpec) -> bool {
        matches!(spec.name.as_str(), "IDLE" | "idle")
    }

    pub fn gen_event_set(
        &mut self,
        ctx: &MeasurementContext,
        _specs: &[EventSpec],
    ) -> Result<(), MeasureError> {
        let metric = ctx
            .metrics
            .register("IDLE", "samples", 1, MetricFlags::BLAME_SHIFTED);
        self.metric = Some(metric);
        ctx.blame.metric.store(metric.0 as u32, Ordering::Release);
        Ok(())
    }

    pub fn armed(&self) -> bool {
        self.metric.is_some()
    }

    pub fn shutdown(&mut self, ctx: &MeasurementContext) {
        ctx.blame.metric.store(u32::MAX, Ordering::Release);
        self.metric = None;
    }

    pub fn display_events(&self) {
        if self.armed() {
            log::info!("blame-shift events: IDLE");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Config;

    #[test]
    fn blame_is_apportioned_across_working_threads() {
        let ctx = MeasurementContext::new(Config::default());
        let mut source = IdleBlameSource::new();
        source.gen_event_set(&ctx, &[]).unwrap();

        ctx.blame.thread_starts_working();
        ctx.blame.thread_starts_working();
        assert_eq!(ctx.blame.adjustment(), None); // nobody idle

        ctx.blame.thread_becomes_idle();
        let (metric, share) = ctx.blame.adjustment().unwrap();
        assert_eq!(metric, source.metric.unwrap());
        assert_eq!(share, 1.0); // one idle, one working

        ctx.blame.thread_resumes_work();
        assert_eq!(ctx.blame.adjustment(), None);
    }

    #[test]
    fn unarmed_blame_never_adjusts() {
        let ctx = MeasurementContext::new(Config::default());
        ctx.blame.thread_starts_working();
        ctx.blame.thread_becomes_idle();
        assert_eq!(ctx.blame.adjustment(), None);
    }
}
