//! perch-runtime: the in-process measurement core of the perch profiler.
//!
//! This library rides inside an unmodified target process (normally via
//! `LD_PRELOAD`, arranged by the `perch` CLI) and turns periodic
//! interrupts into calling-context trees:
//!
//! * sample sources ([`sources`]) arrange for a signal per period of some
//!   event (CPU time, hardware counters, …);
//! * the sample pipeline ([`sample`]) guards the signal context, walks
//!   the interrupted thread's stack with the recipe-driven unwinder
//!   ([`unwind`], [`recipe`], [`analysis`]), and folds the path into the
//!   thread's CCT ([`cct`]) for the current epoch ([`epoch`]);
//! * addresses are made relocation-stable by the loadmap ([`loadmap`]),
//!   fed by the dynamic-link audit interface ([`audit`]);
//! * at thread exit each epoch is serialized to a footer-indexed binary
//!   profile (`perch-profile-format`) under the configured output
//!   directory.
//!
//! The environment contract consumed here is produced by the `perch`
//! CLI; see [`env`].

pub mod analysis;
pub mod arena;
pub mod audit;
pub mod backtrace;
pub mod cct;
pub mod context;
pub mod env;
pub mod epoch;
mod error;
pub mod events;
pub mod files;
pub mod ignore;
pub mod ip;
pub mod loadmap;
pub mod metrics;
pub mod profile_write;
pub mod recipe;
pub mod sample;
pub mod sources;
pub mod stats;
pub mod thread_data;
pub mod trampoline;
pub mod unwind;

use std::sync::atomic::Ordering;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

pub use error::MeasureError;

use context::MeasurementContext;
use sources::SyncEvent;
use thread_data::ThreadData;

/// Initializes measurement for this process: reads the environment
/// contract, arms the requested sample sources, and starts sampling on
/// the calling thread (unless delayed).
///
/// A failure here is fatal by design: the loader exits with status 1
/// rather than run the target unprofiled.
pub fn initialize() -> Result<(), MeasureError> {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .try_init();

    let config = env::Config::from_env();
    let ctx = MeasurementContext::new(config);
    if !context::install(ctx.clone()) {
        return Err(MeasureError::AlreadyInitialized);
    }

    if let Some((lo, hi)) = own_code_range() {
        ctx.ignore.insert(lo, hi, ip::ModuleId::PLACEHOLDER);
    }

    {
        let mut sources = ctx.sources.lock();
        sources.gen_event_sets(&ctx, &ctx.config.events.clone())?;
        sources.init_all(&ctx)?;
        sources.display_events();
    }
    if ctx.config.trampoline {
        let retcnt = ctx
            .metrics
            .register("RETCNT", "returns", 1, metrics::MetricFlags::ASYNC);
        ctx.set_retcnt_metric(retcnt);
    }

    install_termination_handlers()?;
    if let Some(timeout) = ctx.config.abort_timeout {
        install_abort_timeout(timeout.as_secs() as libc::c_uint)?;
    }
    unsafe {
        libc::atexit(process_fini_at_exit);
        libc::pthread_atfork(None, None, Some(fork_child_hook));
    }

    thread_init()?;
    Ok(())
}

/// Registers the calling thread with the measurement system and starts
/// its sample sources. Idempotent.
pub fn thread_init() -> Result<(), MeasureError> {
    let Some(ctx) = context::current() else {
        return Ok(());
    };
    if !thread_data::current_raw().is_null() {
        return Ok(());
    }
    let ordinal = ctx.next_thread_ordinal();
    let Some(td) = ThreadData::new(ctx.clone(), ordinal) else {
        log::warn!("thread {ordinal}: cannot establish arena, running unprofiled");
        return Ok(());
    };
    let td_ptr = thread_data::attach(td);
    let td = unsafe { &mut *td_ptr };

    let mut sources = ctx.sources.lock();
    sources.thread_init_all(td)?;
    if ctx.sampling_active.load(Ordering::Acquire) && !td.suppressed.get() {
        sources.start_all(td);
    }
    Ok(())
}

/// Finalizes the calling thread: suppress further samples, drain any
/// pending sample signal, stop the sources, and write the profile.
pub fn thread_fini() {
    let td_ptr = thread_data::current_raw();
    if td_ptr.is_null() {
        return;
    }
    let td = unsafe { &mut *td_ptr };
    let ctx = td.ctx.clone();

    td.suppressed.set(true);
    block_and_drain_sample_signals();
    ctx.sources.lock().stop_all(td);
    for counter in td.perf_counters.drain(..) {
        unsafe { libc::close(counter.fd) };
    }

    if let Err(err) = profile_write::finalize_thread(td) {
        log::warn!("thread {}: profile write failed: {err}", td.ordinal);
    }
    thread_data::clear_current();
}

/// Finalizes the whole process: the calling thread first, then any
/// thread that never ran its own finalizer.
pub fn process_fini() {
    let Some(ctx) = context::current() else {
        return;
    };
    if ctx.finalizing.swap(true, Ordering::AcqRel) {
        return;
    }
    thread_fini();
    for td_ptr in thread_data::all_registered() {
        // Threads that are still alive are suppressed by the finalizing
        // flag before we touch their descriptors.
        let td = unsafe { &mut *td_ptr };
        td.suppressed.set(true);
        if !td.written.get() {
            if let Err(err) = profile_write::finalize_thread(td) {
                log::warn!("thread {}: profile write failed: {err}", td.ordinal);
            }
        }
    }
    ctx.sources.lock().shutdown_all(&ctx);
    ctx.stats.log_summary();
}

/// The start-stop API: resumes sampling process-wide and (re)starts the
/// calling thread's sources.
pub fn sampling_start() {
    let Some(ctx) = context::current() else {
        return;
    };
    ctx.sampling_active.store(true, Ordering::Release);
    let td_ptr = thread_data::current_raw();
    if !td_ptr.is_null() {
        let td = unsafe { &*td_ptr };
        ctx.sources.lock().start_all(td);
    }
}

pub fn sampling_stop() {
    let Some(ctx) = context::current() else {
        return;
    };
    ctx.sampling_active.store(false, Ordering::Release);
    let td_ptr = thread_data::current_raw();
    if !td_ptr.is_null() {
        let td = unsafe { &*td_ptr };
        ctx.sources.lock().stop_all(td);
    }
}

pub fn sampling_is_active() -> bool {
    context::current()
        .map(|ctx| ctx.sampling_active.load(Ordering::Acquire))
        .unwrap_or(false)
}

/// Delivers a synchronous event (I/O bytes, idle transitions) from an
/// interposed operation on the calling thread.
pub fn process_synchronous_event(event: SyncEvent) {
    let Some(ctx) = context::current() else {
        return;
    };
    let td_ptr = thread_data::current_raw();
    if td_ptr.is_null() {
        return;
    }
    unsafe {
        let mut uc: libc::ucontext_t = std::mem::zeroed();
        if libc::getcontext(&mut uc) != 0 {
            return;
        }
        ctx.sources.lock().process_event(&mut *td_ptr, event, &mut uc);
    }
}

/// Registers the function range that terminates full unwinds of the
/// initial thread (the process-lifecycle collaborator calls this).
pub fn register_process_bottom(start: u64, end: u64) {
    if let Some(ctx) = context::current() {
        ctx.fences.register_process_bottom(start, end);
    }
}

/// Registers the function range that terminates full unwinds of spawned
/// threads.
pub fn register_thread_bottom(start: u64, end: u64) {
    if let Some(ctx) = context::current() {
        ctx.fences.register_thread_bottom(start, end);
    }
}

// ---------------------------------------------------------------------------
// Fork support
// ---------------------------------------------------------------------------

/// Re-initializes per-process state in a forked child: inherited output
/// files are abandoned, counters reset, the CCT restarted, and the
/// source start sequence re-run. Arenas and the loadmap are inherited.
pub fn post_fork_child() {
    let Some(ctx) = context::current() else {
        return;
    };
    ctx.stats.reset();
    ctx.finalizing.store(false, Ordering::Release);
    thread_data::retain_only_current();

    let td_ptr = thread_data::current_raw();
    if td_ptr.is_null() {
        return;
    }
    let td = unsafe { &mut *td_ptr };
    reset_thread_after_fork(td);

    let mut sources = ctx.sources.lock();
    if sources.thread_init_all(td).is_err() {
        td.sampling_disabled.set(true);
        return;
    }
    if ctx.sampling_active.load(Ordering::Acquire) && !td.suppressed.get() {
        sources.start_all(td);
    }
}

fn reset_thread_after_fork(td: &mut ThreadData) {
    // The parent's half-written file belongs to the parent.
    td.writer = None;
    td.written.set(false);
    td.trace = None;
    for counter in td.perf_counters.drain(..) {
        unsafe { libc::close(counter.fd) };
    }
    td.arena.reclaim_freeable();
    let generation = td.ctx.loadmap.generation();
    if !td.epochs.reset(&td.arena, generation) {
        td.sampling_disabled.set(true);
    }
    td.tramp.invalidate();
    if td.ctx.config.trace && !td.suppressed.get() {
        // New pid, new trace file.
        td.trace = profile_write::TraceWriter::create(&files::trace_path(
            &td.ctx.config.out_dir,
            td.ordinal,
        ))
        .ok();
    }
}

unsafe extern "C" fn fork_child_hook() {
    post_fork_child();
}

// ---------------------------------------------------------------------------
// Termination and abort-timeout handling
// ---------------------------------------------------------------------------

extern "C" fn process_fini_at_exit() {
    process_fini();
}

extern "C" fn termination_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _uc: *mut libc::c_void,
) {
    process_fini();
    unsafe { libc::_exit(128 + sig) };
}

fn install_termination_handlers() -> Result<(), MeasureError> {
    let action = SigAction::new(
        SigHandler::SigAction(termination_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        unsafe { sigaction(signal, &action) }.map_err(|errno| MeasureError::SourceInit {
            source_name: "termination",
            reason: format!("sigaction({signal:?}): {errno}"),
        })?;
    }
    Ok(())
}

extern "C" fn abort_timeout_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _uc: *mut libc::c_void,
) {
    process_fini();
    unsafe { libc::abort() };
}

fn install_abort_timeout(seconds: libc::c_uint) -> Result<(), MeasureError> {
    let action = SigAction::new(
        SigHandler::SigAction(abort_timeout_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action) }.map_err(|errno| MeasureError::SourceInit {
        source_name: "abort-timeout",
        reason: format!("sigaction(SIGALRM): {errno}"),
    })?;
    unsafe { libc::alarm(seconds) };
    Ok(())
}

/// Blocks the sample signals in this thread and consumes anything
/// already pending, so finalization cannot race an in-flight sample.
fn block_and_drain_sample_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPROF);
        libc::sigaddset(&mut set, libc::SIGIO);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());

        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut info: libc::siginfo_t = std::mem::zeroed();
        while libc::sigtimedwait(&set, &mut info, &timeout) > 0 {}
    }
}

// ---------------------------------------------------------------------------
// Own code range (for the PC-in-collector check)
// ---------------------------------------------------------------------------

struct FindSelf {
    target: u64,
    lo: u64,
    hi: u64,
    found: bool,
}

unsafe extern "C" fn find_self_cb(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let search = &mut *(data as *mut FindSelf);
    let info = &*info;
    let mut lo = u64::MAX;
    let mut hi = 0u64;
    let mut contains_target = false;
    for i in 0..info.dlpi_phnum {
        let phdr = &*info.dlpi_phdr.add(i as usize);
        if phdr.p_type != libc::PT_LOAD || phdr.p_flags & libc::PF_X == 0 {
            continue;
        }
        let start = info.dlpi_addr as u64 + phdr.p_vaddr;
        let end = start + phdr.p_memsz;
        lo = lo.min(start);
        hi = hi.max(end);
        if search.target >= start && search.target < end {
            contains_target = true;
        }
    }
    if contains_target {
        search.lo = lo;
        search.hi = hi;
        search.found = true;
        return 1;
    }
    0
}

/// The executable address range of the object this code lives in.
fn own_code_range() -> Option<(u64, u64)> {
    let mut search = FindSelf {
        target: own_code_range as usize as u64,
        lo: 0,
        hi: 0,
        found: false,
    };
    unsafe {
        libc::dl_iterate_phdr(
            Some(find_self_cb),
            &mut search as *mut FindSelf as *mut libc::c_void,
        );
    }
    search.found.then_some((search.lo, search.hi))
}

// ---------------------------------------------------------------------------
// C entry points for the preload shim and the auditor
// ---------------------------------------------------------------------------

/// Runs at library load when preloaded into a target (detected by the
/// presence of the event-list variable, so linking this crate into
/// ordinary binaries is inert).
extern "C" fn bootstrap_if_configured() {
    if std::env::var_os(env::EVENT_LIST).is_none() {
        return;
    }
    if let Err(err) = initialize() {
        eprintln!("perch: measurement initialization failed: {err}");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
#[link_section = ".init_array"]
#[used]
static BOOTSTRAP: extern "C" fn() = bootstrap_if_configured;

#[no_mangle]
pub extern "C" fn perch_thread_init() {
    let _ = thread_init();
}

#[no_mangle]
pub extern "C" fn perch_thread_fini() {
    thread_fini();
}

#[no_mangle]
pub extern "C" fn perch_process_fini() {
    process_fini();
}

#[no_mangle]
pub extern "C" fn perch_sampling_start() {
    sampling_start();
}

#[no_mangle]
pub extern "C" fn perch_sampling_stop() {
    sampling_stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Config;

    #[test]
    fn own_code_range_covers_this_function() {
        let (lo, hi) = own_code_range().expect("own object must be found");
        let here = own_code_range as usize as u64;
        assert!(lo <= here && here < hi);
    }

    #[test]
    fn fork_reset_restarts_accumulation() {
        let ctx = MeasurementContext::new(Config::default());
        let mut td = ThreadData::new(ctx, 0).unwrap();

        // Accumulate something, then pretend we forked.
        let frames = [crate::backtrace::Frame {
            ip_norm: ip::NormalizedIp::new(ip::ModuleId(0), 0x40),
            the_function: ip::NormalizedIp::new(ip::ModuleId(0), 0x40),
            ra_loc: 0,
            ra_val: 0,
        }];
        {
            let epoch = td.epochs.current();
            let top = epoch.cct.top;
            let _ = epoch.cct.insert_backtrace(&td.arena, top, &frames, true);
            assert_eq!(epoch.cct.num_nodes, 5);
        }
        td.written.set(true);

        reset_thread_after_fork(&mut td);
        assert!(!td.written.get());
        assert!(td.writer.is_none());
        assert_eq!(td.epochs.len(), 1);
        // The CCT is empty again: just the four roots.
        assert_eq!(td.epochs.current().cct.num_nodes, 4);
    }
}
