//! Per-thread measurement state.
//!
//! Each profiled thread owns one descriptor: its arena, backtrace buffer,
//! epoch list, trampoline cache and output files. The descriptor is built
//! at thread-init (ordinary context) and reached from signal handlers
//! through a thread-local raw pointer; it is deliberately never freed, as
//! its arena backs epochs that remain reachable until write-out.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::backtrace::{self, BacktraceBuffer};
use crate::context::MeasurementContext;
use crate::epoch::EpochList;
use crate::metrics::MetricId;
use crate::profile_write::TraceWriter;
use crate::trampoline::TrampolineCache;
use crate::unwind::{AddressSpace, MemoryFault};

/// One perf-event counter armed on this thread.
#[derive(Debug, Clone, Copy)]
pub struct PerfCounter {
    pub fd: i32,
    pub metric: MetricId,
    pub increment: f64,
}

pub struct ThreadData {
    pub ordinal: u32,
    pub tid: i32,
    pub ctx: Arc<MeasurementContext>,
    pub arena: Arena,
    pub bt_buf: BacktraceBuffer,
    pub epochs: EpochList,
    pub tramp: TrampolineCache,
    pub stack_lo: u64,
    pub stack_hi: u64,
    /// Reentry latch for the sample handler.
    pub handling_sample: Cell<bool>,
    /// Ignored thread, delayed start, or finalization in progress.
    pub suppressed: Cell<bool>,
    /// Latched on arena exhaustion; this thread samples no more.
    pub sampling_disabled: Cell<bool>,
    pub written: Cell<bool>,
    pub writer: Option<perch_profile_format::writer::ProfileWriter<std::fs::File>>,
    pub trace: Option<TraceWriter>,
    pub perf_counters: Vec<PerfCounter>,
}

impl ThreadData {
    /// Builds the descriptor for the calling thread. `None` when the
    /// arena cannot be established; the thread then runs unprofiled.
    pub fn new(ctx: Arc<MeasurementContext>, ordinal: u32) -> Option<Box<ThreadData>> {
        let config = &ctx.config;
        let arena = Arena::new(config.memsize, config.low_memsize);
        let bt_buf = BacktraceBuffer::new_in(&arena, backtrace::DEFAULT_CAPACITY)?;
        let epochs = EpochList::new_in(&arena, ctx.loadmap.generation())?;
        let tramp =
            TrampolineCache::new_in(&arena, backtrace::DEFAULT_CAPACITY, config.trampoline)?;
        let (stack_lo, stack_hi) = current_thread_stack_bounds();

        let suppressed = config.thread_is_ignored(ordinal) || !ctx.recording;
        let trace = if config.trace && !suppressed {
            TraceWriter::create(&crate::files::trace_path(&config.out_dir, ordinal)).ok()
        } else {
            None
        };

        Some(Box::new(ThreadData {
            ordinal,
            tid: unsafe { libc::gettid() },
            ctx,
            arena,
            bt_buf,
            epochs,
            tramp,
            stack_lo,
            stack_hi,
            handling_sample: Cell::new(false),
            suppressed: Cell::new(suppressed),
            sampling_disabled: Cell::new(false),
            written: Cell::new(false),
            writer: None,
            trace,
            perf_counters: Vec::new(),
        }))
    }

    /// The address-space view for a sample taken at stack pointer `sp`.
    pub fn space(&self, sp: u64) -> ThreadSpace {
        ThreadSpace {
            stack_lo: sp,
            stack_hi: self.stack_hi,
        }
    }
}

/// Live reads of the thread's own stack and mapped code, every access
/// bounds-checked so the unwinder cannot fault.
pub struct ThreadSpace {
    pub stack_lo: u64,
    pub stack_hi: u64,
}

impl AddressSpace for ThreadSpace {
    fn read_stack(&self, addr: u64) -> Result<u64, MemoryFault> {
        if addr < self.stack_lo || addr.checked_add(8).is_none_or(|end| end > self.stack_hi) {
            return Err(MemoryFault);
        }
        if addr % 8 != 0 {
            return Err(MemoryFault);
        }
        Ok(unsafe { std::ptr::read_volatile(addr as *const u64) })
    }

    fn code_bytes(&self, start: u64, len: usize) -> Option<&[u8]> {
        // Ranges come from the loadmap's function bounds, which lie inside
        // a mapped module image.
        if start == 0 || len == 0 || len > (1 << 24) {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(start as *const u8, len) })
    }

    fn stack_top(&self) -> u64 {
        self.stack_hi
    }
}

fn current_thread_stack_bounds() -> (u64, u64) {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return (0, u64::MAX);
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return (0, u64::MAX);
        }
        (addr as u64, addr as u64 + size as u64)
    }
}

// ---------------------------------------------------------------------------
// Thread-local descriptor pointer and the process-wide registry.
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: Cell<*mut ThreadData> = const { Cell::new(std::ptr::null_mut()) };
}

struct SendPtr(*mut ThreadData);
unsafe impl Send for SendPtr {}

static REGISTRY: Mutex<Vec<SendPtr>> = Mutex::new(Vec::new());

/// Takes ownership of the descriptor, wires up the thread-local pointer
/// and registers it for finalization.
pub fn attach(td: Box<ThreadData>) -> *mut ThreadData {
    let ptr = Box::into_raw(td);
    CURRENT.with(|current| current.set(ptr));
    REGISTRY.lock().push(SendPtr(ptr));
    ptr
}

/// The calling thread's descriptor, or null before thread-init.
pub fn current_raw() -> *mut ThreadData {
    CURRENT.try_with(|current| current.get()).unwrap_or(std::ptr::null_mut())
}

pub fn clear_current() {
    CURRENT.with(|current| current.set(std::ptr::null_mut()));
}

/// Every descriptor ever attached (for process finalization).
pub fn all_registered() -> Vec<*mut ThreadData> {
    REGISTRY.lock().iter().map(|p| p.0).collect()
}

/// After fork, only the calling thread exists; descriptors of the
/// parent's other threads are dead weight in the child.
pub fn retain_only_current() {
    let current = current_raw();
    REGISTRY.lock().retain(|p| p.0 == current);
}
