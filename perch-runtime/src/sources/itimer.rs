//! The interval-timer sample source: `setitimer(ITIMER_PROF)` + SIGPROF.
//!
//! Fires a signal after every period of combined user+system CPU time and
//! charges a CPUTIME metric of `period` microseconds per sample. The
//! handler reaches its metric through process-wide atomics because signal
//! handlers cannot carry state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::context::MeasurementContext;
use crate::error::MeasureError;
use crate::events::{EventSpec, SampleBy};
use crate::metrics::{MetricFlags, MetricId};
use crate::sample;
use crate::thread_data::ThreadData;

pub const DEFAULT_PERIOD_US: u64 = 5000;

static METRIC: AtomicU32 = AtomicU32::new(u32::MAX);
static INCREMENT_BITS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
pub struct ItimerSource {
    metric: Option<MetricId>,
    period_us: u64,
    started: AtomicBool,
}

impl ItimerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports_event(&self, spec: &EventSpec) -> bool {
        matches!(spec.name.as_str(), "CPUTIME" | "cputime")
    }

    pub fn gen_event_set(
        &mut self,
        ctx: &MeasurementContext,
        specs: &[EventSpec],
    ) -> Result<(), MeasureError> {
        let spec = &specs[0];
        self.period_us = match spec.how {
            SampleBy::Period(us) => us,
            SampleBy::Frequency(hz) => 1_000_000 / hz.max(1),
            SampleBy::Default => DEFAULT_PERIOD_US,
        };
        let metric = ctx
            .metrics
            .register("CPUTIME", "us", self.period_us, MetricFlags::ASYNC);
        self.metric = Some(metric);
        METRIC.store(metric.0 as u32, Ordering::Release);
        INCREMENT_BITS.store((self.period_us as f64).to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn init(&mut self, _ctx: &MeasurementContext) -> Result<(), MeasureError> {
        let action = SigAction::new(
            SigHandler::SigAction(itimer_handler),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGPROF, &action) }.map_err(|errno| {
            MeasureError::SourceInit {
                source_name: "itimer",
                reason: format!("sigaction(SIGPROF): {errno}"),
            }
        })?;
        Ok(())
    }

    pub fn thread_init(&mut self, _td: &mut ThreadData) -> Result<(), MeasureError> {
        Ok(())
    }

    pub fn start(&self, _td: &ThreadData) {
        if self.metric.is_none() {
            return;
        }
        set_timer(self.period_us);
        self.started.store(true, Ordering::Release);
    }

    pub fn stop(&self, _td: &ThreadData) {
        set_timer(0);
        self.started.store(false, Ordering::Release);
    }

    pub fn shutdown(&mut self) {
        set_timer(0);
        self.started.store(false, Ordering::Release);
        METRIC.store(u32::MAX, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn display_events(&self) {
        log::info!("itimer events: CPUTIME (period {} us)", self.period_us);
    }
}

fn set_timer(period_us: u64) {
    let interval = libc::timeval {
        tv_sec: (period_us / 1_000_000) as libc::time_t,
        tv_usec: (period_us % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) };
}

extern "C" fn itimer_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let metric = METRIC.load(Ordering::Acquire);
    if metric == u32::MAX {
        return;
    }
    let increment = f64::from_bits(INCREMENT_BITS.load(Ordering::Acquire));
    unsafe {
        sample::sample_event(
            uc as *mut libc::ucontext_t,
            MetricId(metric as u16),
            increment,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Config;

    #[test]
    fn frequency_requests_become_periods() {
        let ctx = MeasurementContext::new(Config::default());
        let mut source = ItimerSource::new();
        source
            .gen_event_set(&ctx, &[EventSpec::new("CPUTIME", SampleBy::Frequency(200))])
            .unwrap();
        assert_eq!(source.period_us, 5000);
        assert_eq!(ctx.metrics.snapshot()[0].period, 5000);
    }

    #[test]
    fn only_cputime_is_supported() {
        let source = ItimerSource::new();
        assert!(source.supports_event(&EventSpec::new("CPUTIME", SampleBy::Default)));
        assert!(!source.supports_event(&EventSpec::new("cycles", SampleBy::Default)));
    }
}
