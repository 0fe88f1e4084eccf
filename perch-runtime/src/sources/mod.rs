//! Sample sources: where the interrupts (or synchronous events) come from.
//!
//! Each source is a variant of [`SampleSource`] and implements the same
//! capability set — init, thread-init, start, stop, shutdown, event
//! support and display — dispatched by `match` rather than through
//! trait objects. A [`SourceSet`] routes each requested event to the
//! first source that supports it and fans the lifecycle calls out to the
//! sources that ended up with events.

pub mod idle;
pub mod io;
pub mod itimer;
pub mod perf;
pub mod sys;

use idle::IdleBlameSource;
use io::IoBytesSource;
use itimer::ItimerSource;
use perf::PerfEventSource;

use crate::context::MeasurementContext;
use crate::error::MeasureError;
use crate::events::EventSpec;
use crate::thread_data::ThreadData;

/// A synchronous event reported by an interposed operation.
#[derive(Debug, Clone, Copy)]
pub enum SyncEvent {
    IoRead { bytes: u64 },
    IoWrite { bytes: u64 },
    ThreadBecomesIdle,
    ThreadResumesWork,
}

pub enum SampleSource {
    Itimer(ItimerSource),
    Perf(PerfEventSource),
    Io(IoBytesSource),
    Idle(IdleBlameSource),
}

impl SampleSource {
    pub fn name(&self) -> &'static str {
        match self {
            SampleSource::Itimer(_) => "itimer",
            SampleSource::Perf(_) => "perf-event",
            SampleSource::Io(_) => "io",
            SampleSource::Idle(_) => "idle-blame",
        }
    }

    pub fn supports_event(&self, spec: &EventSpec) -> bool {
        match self {
            SampleSource::Itimer(s) => s.supports_event(spec),
            SampleSource::Perf(s) => s.supports_event(spec),
            SampleSource::Io(s) => s.supports_event(spec),
            SampleSource::Idle(s) => s.supports_event(spec),
        }
    }

    fn gen_event_set(
        &mut self,
        ctx: &MeasurementContext,
        specs: &[EventSpec],
    ) -> Result<(), MeasureError> {
        match self {
            SampleSource::Itimer(s) => s.gen_event_set(ctx, specs),
            SampleSource::Perf(s) => s.gen_event_set(ctx, specs),
            SampleSource::Io(s) => s.gen_event_set(ctx, specs),
            SampleSource::Idle(s) => s.gen_event_set(ctx, specs),
        }
    }

    fn init(&mut self, ctx: &MeasurementContext) -> Result<(), MeasureError> {
        match self {
            SampleSource::Itimer(s) => s.init(ctx),
            SampleSource::Perf(s) => s.init(ctx),
            SampleSource::Io(_) | SampleSource::Idle(_) => Ok(()),
        }
    }

    fn thread_init(&mut self, td: &mut ThreadData) -> Result<(), MeasureError> {
        match self {
            SampleSource::Itimer(s) => s.thread_init(td),
            SampleSource::Perf(s) => s.thread_init(td),
            SampleSource::Io(_) => Ok(()),
            SampleSource::Idle(_) => {
                td.ctx.blame.thread_starts_working();
                Ok(())
            }
        }
    }

    fn start(&self, td: &ThreadData) {
        match self {
            SampleSource::Itimer(s) => s.start(td),
            SampleSource::Perf(s) => s.start(td),
            SampleSource::Io(_) | SampleSource::Idle(_) => {}
        }
    }

    fn stop(&self, td: &ThreadData) {
        match self {
            SampleSource::Itimer(s) => s.stop(td),
            SampleSource::Perf(s) => s.stop(td),
            SampleSource::Io(_) | SampleSource::Idle(_) => {}
        }
    }

    fn shutdown(&mut self, ctx: &MeasurementContext) {
        match self {
            SampleSource::Itimer(s) => s.shutdown(),
            SampleSource::Perf(s) => s.shutdown(),
            SampleSource::Io(_) => {}
            SampleSource::Idle(s) => s.shutdown(ctx),
        }
    }

    pub fn started(&self) -> bool {
        match self {
            SampleSource::Itimer(s) => s.started(),
            SampleSource::Perf(s) => s.started(),
            SampleSource::Io(s) => s.armed(),
            SampleSource::Idle(s) => s.armed(),
        }
    }

    pub fn display_events(&self) {
        match self {
            SampleSource::Itimer(s) => s.display_events(),
            SampleSource::Perf(s) => s.display_events(),
            SampleSource::Io(s) => s.display_events(),
            SampleSource::Idle(s) => s.display_events(),
        }
    }
}

pub struct SourceSet {
    sources: Vec<SampleSource>,
    /// Indices of sources that accepted at least one event.
    armed: Vec<usize>,
}

impl Default for SourceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceSet {
    pub fn new() -> SourceSet {
        SourceSet {
            sources: vec![
                SampleSource::Itimer(ItimerSource::new()),
                SampleSource::Perf(PerfEventSource::new()),
                SampleSource::Io(IoBytesSource::new()),
                SampleSource::Idle(IdleBlameSource::new()),
            ],
            armed: Vec::new(),
        }
    }

    /// Routes every requested event to the first source that supports it
    /// and lets those sources register their metrics.
    pub fn gen_event_sets(
        &mut self,
        ctx: &MeasurementContext,
        specs: &[EventSpec],
    ) -> Result<(), MeasureError> {
        if specs.is_empty() {
            return Err(MeasureError::NoEvents(crate::env::EVENT_LIST));
        }
        let mut routed: Vec<Vec<EventSpec>> = vec![Vec::new(); self.sources.len()];
        for spec in specs {
            let index = self
                .sources
                .iter()
                .position(|source| source.supports_event(spec))
                .ok_or_else(|| MeasureError::UnsupportedEvent(spec.name.clone()))?;
            routed[index].push(spec.clone());
        }
        for (index, specs) in routed.into_iter().enumerate() {
            if specs.is_empty() {
                continue;
            }
            self.sources[index].gen_event_set(ctx, &specs)?;
            self.armed.push(index);
        }
        Ok(())
    }

    pub fn init_all(&mut self, ctx: &MeasurementContext) -> Result<(), MeasureError> {
        for &index in &self.armed {
            self.sources[index].init(ctx)?;
        }
        Ok(())
    }

    pub fn thread_init_all(&mut self, td: &mut ThreadData) -> Result<(), MeasureError> {
        for &index in &self.armed {
            self.sources[index].thread_init(td)?;
        }
        Ok(())
    }

    pub fn start_all(&self, td: &ThreadData) {
        for &index in &self.armed {
            self.sources[index].start(td);
        }
    }

    pub fn stop_all(&self, td: &ThreadData) {
        for &index in &self.armed {
            self.sources[index].stop(td);
        }
    }

    pub fn shutdown_all(&mut self, ctx: &MeasurementContext) {
        for index in std::mem::take(&mut self.armed) {
            self.sources[index].shutdown(ctx);
        }
    }

    pub fn any_started(&self) -> bool {
        self.armed.iter().any(|&index| self.sources[index].started())
    }

    pub fn display_events(&self) {
        for &index in &self.armed {
            self.sources[index].display_events();
        }
    }

    /// Delivers a synchronous event from an interposed operation.
    ///
    /// # Safety
    ///
    /// `uc` must describe the calling thread's current context (it may be
    /// null for events that do not take a sample).
    pub unsafe fn process_event(
        &self,
        td: &mut ThreadData,
        event: SyncEvent,
        uc: *mut libc::ucontext_t,
    ) {
        match event {
            SyncEvent::IoRead { bytes } | SyncEvent::IoWrite { bytes } => {
                let write = matches!(event, SyncEvent::IoWrite { .. });
                for source in &self.sources {
                    if let SampleSource::Io(io) = source {
                        if io.armed() && !uc.is_null() {
                            io.record_io(td, write, bytes, uc);
                        }
                    }
                }
            }
            SyncEvent::ThreadBecomesIdle => td.ctx.blame.thread_becomes_idle(),
            SyncEvent::ThreadResumesWork => td.ctx.blame.thread_resumes_work(),
        }
    }
}
