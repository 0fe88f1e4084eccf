//! The I/O-bytes synthetic source.
//!
//! Nothing here fires asynchronously: the read/write wrappers (external
//! collaborators interposing on libc) call in with the byte count and the
//! caller's context, and the sample is taken synchronously at that point,
//! charging whole byte counts instead of a fixed period.

use crate::context::MeasurementContext;
use crate::error::MeasureError;
use crate::events::EventSpec;
use crate::metrics::{MetricFlags, MetricId};
use crate::sample;
use crate::thread_data::ThreadData;

#[derive(Debug, Default)]
pub struct IoBytesSource {
    read_metric: Option<MetricId>,
    write_metric: Option<MetricId>,
}

impl IoBytesSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports_event(&self, spec: &EventSpec) -> bool {
        matches!(spec.name.as_str(), "IO" | "io")
    }

    pub fn gen_event_set(
        &mut self,
        ctx: &MeasurementContext,
        _specs: &[EventSpec],
    ) -> Result<(), MeasureError> {
        self.read_metric =
            Some(ctx.metrics
                .register("IO-READ-BYTES", "bytes", 1, MetricFlags::SYNC));
        self.write_metric =
            Some(ctx.metrics
                .register("IO-WRITE-BYTES", "bytes", 1, MetricFlags::SYNC));
        Ok(())
    }

    pub fn armed(&self) -> bool {
        self.read_metric.is_some()
    }

    /// Synchronous sample on behalf of an interposed read/write.
    ///
    /// # Safety
    ///
    /// `uc` must describe the calling thread's current context.
    pub unsafe fn record_io(&self, _td: &ThreadData, write: bool, bytes: u64, uc: *mut libc::ucontext_t) {
        let metric = if write {
            self.write_metric
        } else {
            self.read_metric
        };
        if let Some(metric) = metric {
            sample::sample_event(uc, metric, bytes as f64);
        }
    }

    pub fn display_events(&self) {
        if self.armed() {
            log::info!("io events: IO-READ-BYTES, IO-WRITE-BYTES");
        }
    }
}
