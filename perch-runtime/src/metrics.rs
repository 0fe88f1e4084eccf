//! The process-wide metric kind registry.
//!
//! Sources register their metrics during initialization and get back dense
//! ids; the sample path only ever carries a `MetricId` and an increment.
//! The registry is append-only, so a snapshot taken by the writer is always
//! a prefix-consistent view.

use bitflags::bitflags;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricId(pub u16);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetricFlags: u32 {
        /// Credited from an asynchronous sample signal.
        const ASYNC = 1 << 0;
        /// Credited synchronously by an instrumented operation.
        const SYNC = 1 << 1;
        /// Attributed to a different context than the sampled one.
        const BLAME_SHIFTED = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct MetricDesc {
    pub name: String,
    pub unit: &'static str,
    pub period: u64,
    pub flags: MetricFlags,
}

#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: RwLock<Vec<MetricDesc>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        unit: &'static str,
        period: u64,
        flags: MetricFlags,
    ) -> MetricId {
        let mut metrics = self.metrics.write();
        assert!(metrics.len() < u16::MAX as usize, "metric ids exhausted");
        let id = MetricId(metrics.len() as u16);
        metrics.push(MetricDesc {
            name: name.to_string(),
            unit,
            period,
            flags,
        });
        id
    }

    pub fn count(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn snapshot(&self) -> Vec<MetricDesc> {
        self.metrics.read().clone()
    }
}
