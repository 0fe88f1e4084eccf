//! The hardware-counter sample source, built on `perf_event_open`.
//!
//! One counter per requested event per thread. Overflow notification uses
//! the fd-ownership route: the counter fd is put in async mode, its signal
//! retargeted to SIGIO and its owner pinned to the profiled thread, so the
//! overflow signal interrupts the thread whose counter overflowed. The
//! handler recovers the counter from `si_fd`, records the sample and
//! re-arms the counter with `IOC_REFRESH(1)`.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use super::sys;
use crate::context::MeasurementContext;
use crate::error::MeasureError;
use crate::events::{EventSpec, SampleBy};
use crate::metrics::{MetricFlags, MetricId};
use crate::sample;
use crate::thread_data::{PerfCounter, ThreadData};

/// Default sampling period, in events, for period-less requests.
pub const DEFAULT_PERIOD: u64 = 1_000_000;

#[derive(Debug, Clone)]
struct EventConfig {
    name: String,
    kind: u32,
    config: u64,
    how: SampleBy,
    metric: MetricId,
    increment: f64,
}

#[derive(Debug, Default)]
pub struct PerfEventSource {
    events: Vec<EventConfig>,
    started: AtomicBool,
}

/// Maps an event name to a perf (type, config) pair.
fn event_code(name: &str) -> Option<(u32, u64)> {
    let code = match name {
        "cycles" | "cpu-cycles" => (sys::PERF_TYPE_HARDWARE, sys::PERF_COUNT_HW_CPU_CYCLES),
        "instructions" => (sys::PERF_TYPE_HARDWARE, sys::PERF_COUNT_HW_INSTRUCTIONS),
        "cache-references" => (
            sys::PERF_TYPE_HARDWARE,
            sys::PERF_COUNT_HW_CACHE_REFERENCES,
        ),
        "cache-misses" => (sys::PERF_TYPE_HARDWARE, sys::PERF_COUNT_HW_CACHE_MISSES),
        "branches" => (
            sys::PERF_TYPE_HARDWARE,
            sys::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
        ),
        "branch-misses" => (sys::PERF_TYPE_HARDWARE, sys::PERF_COUNT_HW_BRANCH_MISSES),
        "task-clock" => (sys::PERF_TYPE_SOFTWARE, sys::PERF_COUNT_SW_TASK_CLOCK),
        "page-faults" => (sys::PERF_TYPE_SOFTWARE, sys::PERF_COUNT_SW_PAGE_FAULTS),
        "context-switches" => (sys::PERF_TYPE_SOFTWARE, sys::PERF_COUNT_SW_CONTEXT_SWITCHES),
        _ => {
            // rNNNN: raw event code in hex.
            let hex = name.strip_prefix('r')?;
            let config = u64::from_str_radix(hex, 16).ok()?;
            (sys::PERF_TYPE_RAW, config)
        }
    };
    Some(code)
}

impl PerfEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports_event(&self, spec: &EventSpec) -> bool {
        event_code(&spec.name).is_some()
    }

    pub fn gen_event_set(
        &mut self,
        ctx: &MeasurementContext,
        specs: &[EventSpec],
    ) -> Result<(), MeasureError> {
        for spec in specs {
            let Some((kind, config)) = event_code(&spec.name) else {
                return Err(MeasureError::UnsupportedEvent(spec.name.clone()));
            };
            let (period, increment) = match spec.how {
                SampleBy::Period(period) => (period, period as f64),
                SampleBy::Frequency(hz) => (hz, 1.0),
                SampleBy::Default => (DEFAULT_PERIOD, DEFAULT_PERIOD as f64),
            };
            let metric =
                ctx.metrics
                    .register(&spec.name, "events", period, MetricFlags::ASYNC);
            self.events.push(EventConfig {
                name: spec.name.clone(),
                kind,
                config,
                how: spec.how,
                metric,
                increment,
            });
        }
        Ok(())
    }

    pub fn init(&mut self, _ctx: &MeasurementContext) -> Result<(), MeasureError> {
        let action = SigAction::new(
            SigHandler::SigAction(perf_handler),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGIO, &action) }.map_err(|errno| MeasureError::SourceInit {
            source_name: "perf-event",
            reason: format!("sigaction(SIGIO): {errno}"),
        })?;
        Ok(())
    }

    /// Opens and wires one counter per event for the calling thread.
    pub fn thread_init(&mut self, td: &mut ThreadData) -> Result<(), MeasureError> {
        for event in &self.events {
            let mut attr = sys::PerfEventAttr {
                kind: event.kind,
                size: sys::PERF_ATTR_SIZE,
                config: event.config,
                flags: sys::PERF_ATTR_FLAG_DISABLED
                    | sys::PERF_ATTR_FLAG_EXCLUDE_KERNEL
                    | sys::PERF_ATTR_FLAG_EXCLUDE_HV,
                wakeup_events_or_watermark: 1,
                ..Default::default()
            };
            attr.sample_period_or_freq = match event.how {
                SampleBy::Period(period) => period,
                SampleBy::Frequency(hz) => {
                    attr.flags |= sys::PERF_ATTR_FLAG_FREQ;
                    hz
                }
                SampleBy::Default => DEFAULT_PERIOD,
            };

            let fd = unsafe { sys::perf_event_open(&attr, 0, -1, -1, sys::PERF_FLAG_FD_CLOEXEC) };
            if fd < 0 {
                let errno = std::io::Error::last_os_error();
                return Err(MeasureError::SourceInit {
                    source_name: "perf-event",
                    reason: format!("perf_event_open({}) failed: {errno}", event.name),
                });
            }
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC | libc::O_NONBLOCK);
                libc::fcntl(fd, sys::F_SETSIG, libc::SIGIO);
                let owner = sys::FOwnerEx {
                    type_: sys::F_OWNER_TID,
                    pid: td.tid,
                };
                libc::fcntl(fd, sys::F_SETOWN_EX, &owner);
            }
            td.perf_counters.push(PerfCounter {
                fd,
                metric: event.metric,
                increment: event.increment,
            });
        }
        Ok(())
    }

    /// Arms every counter of the calling thread for one overflow.
    pub fn start(&self, td: &ThreadData) {
        for counter in &td.perf_counters {
            unsafe {
                libc::ioctl(counter.fd, sys::PERF_EVENT_IOC_RESET, 0);
                libc::ioctl(counter.fd, sys::PERF_EVENT_IOC_REFRESH, 1);
            }
        }
        if !td.perf_counters.is_empty() {
            self.started.store(true, Ordering::Release);
        }
    }

    pub fn stop(&self, td: &ThreadData) {
        for counter in &td.perf_counters {
            unsafe { libc::ioctl(counter.fd, sys::PERF_EVENT_IOC_DISABLE, 0) };
        }
        self.started.store(false, Ordering::Release);
    }

    pub fn shutdown(&mut self) {
        self.started.store(false, Ordering::Release);
        self.events.clear();
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn display_events(&self) {
        for event in &self.events {
            log::info!(
                "perf event: {} (type {}, config {:#x}, {:?})",
                event.name,
                event.kind,
                event.config,
                event.how
            );
        }
    }
}

extern "C" fn perf_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let fd = unsafe { sys::siginfo_fd(info) };
    let td_ptr = crate::thread_data::current_raw();
    if !td_ptr.is_null() {
        let counters = unsafe { &(*td_ptr).perf_counters };
        if let Some(counter) = counters.iter().find(|c| c.fd == fd) {
            unsafe {
                sample::sample_event(uc as *mut libc::ucontext_t, counter.metric, counter.increment);
            }
        }
    }
    if fd >= 0 {
        // Re-arm for the next overflow even when the sample was dropped.
        unsafe { libc::ioctl(fd, sys::PERF_EVENT_IOC_REFRESH, 1) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Config;

    #[test]
    fn event_names_map_to_perf_codes() {
        assert_eq!(event_code("cycles"), Some((sys::PERF_TYPE_HARDWARE, 0)));
        assert_eq!(event_code("page-faults"), Some((sys::PERF_TYPE_SOFTWARE, 2)));
        assert_eq!(event_code("r01c2"), Some((sys::PERF_TYPE_RAW, 0x01c2)));
        assert_eq!(event_code("no-such-event"), None);
        assert_eq!(event_code("rzz"), None);
    }

    #[test]
    fn gen_event_set_registers_one_metric_per_event() {
        let ctx = MeasurementContext::new(Config::default());
        let mut source = PerfEventSource::new();
        source
            .gen_event_set(
                &ctx,
                &[
                    EventSpec::new("cycles", SampleBy::Period(1_000_000)),
                    EventSpec::new("cache-misses", SampleBy::Frequency(100)),
                ],
            )
            .unwrap();
        let metrics = ctx.metrics.snapshot();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "cycles");
        assert_eq!(metrics[0].period, 1_000_000);
        assert_eq!(metrics[1].name, "cache-misses");
        assert_eq!(source.events.len(), 2);
        assert_eq!(source.events[0].increment, 1_000_000.0);
        assert_eq!(source.events[1].increment, 1.0);
    }
}
