//! The sample pipeline: what runs when a sample signal lands.
//!
//! [`sample_event`] is the async-signal-safe entry called by every sample
//! source's handler. It guards against reentry, preserves errno, and runs
//! the pipeline: check suppression, check the PC against the collector's
//! own ranges, pick the epoch, harvest a backtrace, fold it into the CCT,
//! credit the metric, optionally emit a trace record. Every failure mode
//! is a counted drop; nothing propagates to the interrupted code.

use std::sync::Arc;

use crate::backtrace::generate_backtrace;
use crate::metrics::MetricId;
use crate::profile_write;
use crate::stats::{add, inc};
use crate::thread_data::{self, ThreadData};
use crate::trampoline::PrefixMatch;
use crate::unwind::{arch, AddressSpace, Fence, RegisterSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Recorded,
    /// Signal landed before thread-init or after finalization.
    DroppedNoThread,
    /// A sample was already in flight on this thread.
    DroppedReentry,
    /// Thread suppressed, sampling stopped, or thread disabled.
    DroppedFiltered,
    /// PC was inside the measurement runtime.
    DroppedInCollector,
    /// Loadmap or recipe cache contended.
    DroppedContended,
    /// Arena exhausted; sampling now disabled on this thread.
    DroppedOom,
}

/// Signal-handler entry point.
///
/// # Safety
///
/// `uc` must be the `ucontext_t` passed to a `SA_SIGINFO` handler on the
/// current thread.
pub unsafe fn sample_event(
    uc: *mut libc::ucontext_t,
    metric: MetricId,
    increment: f64,
) -> SampleOutcome {
    let td_ptr = thread_data::current_raw();
    if td_ptr.is_null() {
        return SampleOutcome::DroppedNoThread;
    }
    // Single-writer: this thread is the only one that touches its
    // descriptor, and the reentry latch keeps nested signals out.
    let td = &mut *td_ptr;

    let errno_loc = libc::__errno_location();
    let saved_errno = *errno_loc;

    if td.handling_sample.get() {
        inc(&td.ctx.stats.samples_blocked_async);
        *errno_loc = saved_errno;
        return SampleOutcome::DroppedReentry;
    }
    td.handling_sample.set(true);

    let regs = arch::register_snapshot(uc);
    let space = td.space(regs.sp);
    let outcome = record_sample(td, &space, &regs, metric, increment);

    td.handling_sample.set(false);
    *errno_loc = saved_errno;
    outcome
}

/// The pipeline proper, parameterized over the address space so the
/// whole path is drivable from tests with synthetic stacks.
pub fn record_sample(
    td: &mut ThreadData,
    space: &dyn AddressSpace,
    regs: &RegisterSnapshot,
    metric: MetricId,
    increment: f64,
) -> SampleOutcome {
    let ctx = Arc::clone(&td.ctx);
    let stats = &ctx.stats;
    inc(&stats.samples_attempted);

    if td.suppressed.get()
        || td.sampling_disabled.get()
        || !ctx.sampling_active.load(std::sync::atomic::Ordering::Acquire)
        || ctx.finalizing.load(std::sync::atomic::Ordering::Acquire)
    {
        inc(&stats.samples_filtered);
        return SampleOutcome::DroppedFiltered;
    }

    if ctx.ignore.contains(regs.pc) {
        inc(&stats.samples_blocked_in_collector);
        return SampleOutcome::DroppedInCollector;
    }

    match td.epochs.ensure_current(&td.arena, ctx.loadmap.generation()) {
        None => return out_of_memory(td, &ctx),
        Some(true) => td.tramp.invalidate(),
        Some(false) => {}
    }

    let unwinder = ctx.unwinder();
    let info = generate_backtrace(&unwinder, space, regs, &mut td.bt_buf);
    if info.contended {
        inc(&stats.samples_blocked_dlopen);
        return SampleOutcome::DroppedContended;
    }
    if info.faulted {
        inc(&stats.samples_segv);
    } else if info.partial {
        inc(&stats.samples_partial);
    }
    if info.trolled {
        inc(&stats.samples_trolled);
    }
    add(&stats.frames_total, info.len as u64);

    let fold_recursion = !ctx.config.retain_recursion;
    let epoch = td.epochs.current();
    let root = if info.partial {
        epoch.cct.partial_unwind_root
    } else if info.fence == Fence::ProcessBottom {
        epoch.cct.top
    } else {
        epoch.cct.thread_root
    };
    let frames = td.bt_buf.frames();

    let mut leaf = None;
    if !info.partial {
        match td.tramp.compare(frames) {
            PrefixMatch::Identical(node) => leaf = Some(node),
            PrefixMatch::Returned { returned } => {
                if let (Some(prev), Some(retcnt)) =
                    (td.tramp.previous_leaf(), ctx.retcnt_metric())
                {
                    epoch.cct.add_metric(&td.arena, prev, retcnt, returned as f64);
                }
            }
            PrefixMatch::None => {}
        }
    }
    let leaf = match leaf {
        Some(leaf) => leaf,
        None => match epoch.cct.insert_backtrace(&td.arena, root, frames, fold_recursion) {
            Some(leaf) => leaf,
            None => return out_of_memory(td, &ctx),
        },
    };

    if !epoch.cct.add_metric(&td.arena, leaf, metric, increment) && !increment.is_nan() {
        return out_of_memory(td, &ctx);
    }
    if let Some((blame_metric, share)) = ctx.blame.adjustment() {
        epoch.cct.add_metric(&td.arena, leaf, blame_metric, share);
    }

    if info.partial {
        td.tramp.invalidate();
    } else {
        td.tramp.record(frames, leaf);
    }

    if let Some(trace) = td.trace.as_mut() {
        let node_id = epoch.cct.node(leaf).persistent_id;
        if trace.emit(monotonic_ns(), node_id).is_ok() {
            inc(&stats.trace_records);
        }
    }

    inc(&stats.samples_total);

    if td.arena.low_on_memory() {
        profile_write::flush(td);
    }

    SampleOutcome::Recorded
}

fn out_of_memory(td: &mut ThreadData, ctx: &crate::context::MeasurementContext) -> SampleOutcome {
    inc(&ctx.stats.oom_failures);
    td.sampling_disabled.set(true);
    if td.arena.take_oom_report() {
        // Async-signal-safe one-shot diagnostic.
        let msg = b"perch: thread arena exhausted, sampling disabled on this thread\n";
        unsafe { libc::write(2, msg.as_ptr().cast(), msg.len()) };
    }
    SampleOutcome::DroppedOom
}

pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::context::MeasurementContext;
    use crate::env::Config;
    use crate::ip::{ModuleId, NormalizedIp};
    use crate::unwind::testing::{plain_module_info, SyntheticSpace};

    /// A context with main -> f -> g mapped and a fence on main, plus a
    /// thread descriptor; the synthetic stack holds g's two outer frames.
    fn world(config: Config) -> (std::sync::Arc<MeasurementContext>, Box<ThreadData>, SyntheticSpace, RegisterSnapshot)
    {
        let ctx = MeasurementContext::new(config);
        ctx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            plain_module_info(
                0x1000,
                vec![(0x1000, 0x1080), (0x1100, 0x1180), (0x1200, 0x1280)],
            ),
        );
        ctx.fences.register_process_bottom(0x1000, 0x1080);

        let mut mem = SyntheticSpace::with_stack(0x7000, vec![0; 64]);
        for start in [0x1000u64, 0x1100, 0x1200] {
            let mut code = vec![0x55, 0x48, 0x89, 0xe5];
            code.extend(vec![0x90; 0x7c]);
            mem.add_code(start, code);
        }
        mem.stack[2] = 0x7030;
        mem.stack[3] = 0x1140;
        mem.stack[6] = 0x7050;
        mem.stack[7] = 0x1040;

        let ordinal = ctx.next_thread_ordinal();
        let td = ThreadData::new(ctx.clone(), ordinal).unwrap();
        let regs = RegisterSnapshot {
            pc: 0x1240,
            sp: 0x7000,
            bp: 0x7010,
            lr: None,
        };
        (ctx, td, mem, regs)
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.trace = false;
        config
    }

    #[test]
    fn ten_samples_charge_the_leaf_ten_times() {
        let (ctx, mut td, mem, regs) = world(quiet_config());
        let metric = MetricId(0);
        for _ in 0..10 {
            assert_eq!(
                record_sample(&mut td, &mem, &regs, metric, 1.0),
                SampleOutcome::Recorded
            );
        }
        assert_eq!(ctx.stats.samples_total.load(Ordering::Relaxed), 10);

        let epoch = td.epochs.current();
        let frames = td.bt_buf.frames().to_vec();
        assert_eq!(frames.len(), 3);
        let top = epoch.cct.top;
        let leaf = epoch
            .cct
            .insert_backtrace(&td.arena, top, &frames, true)
            .unwrap();
        assert_eq!(epoch.cct.metric_values(leaf), &[(metric, 10.0)]);
        // The chain hangs below the process root: g's parent is f, whose
        // parent is main, whose parent is the root.
        let f = epoch.cct.node(leaf).parent;
        let main = epoch.cct.node(f).parent;
        assert_eq!(epoch.cct.node(main).parent, top);
        assert_eq!(
            epoch.cct.node(main).addr,
            NormalizedIp::new(ModuleId(0), 0x03f)
        );
    }

    #[test]
    fn fault_mid_unwind_lands_under_the_partial_root_and_recovers() {
        let (ctx, mut td, mut mem, regs) = world(quiet_config());
        let metric = MetricId(0);

        // First sample faults after two frames: f's frame is unreadable.
        let full_stack = mem.stack.clone();
        mem.stack.truncate(4);
        assert_eq!(
            record_sample(&mut td, &mem, &regs, metric, 1.0),
            SampleOutcome::Recorded
        );
        assert_eq!(ctx.stats.samples_segv.load(Ordering::Relaxed), 1);
        {
            let epoch = td.epochs.current();
            let partial_root = epoch.cct.partial_unwind_root;
            let frames = td.bt_buf.frames().to_vec();
            assert_eq!(frames.len(), 2);
            let leaf = epoch
                .cct
                .insert_backtrace(&td.arena, partial_root, &frames, true)
                .unwrap();
            assert_eq!(epoch.cct.metric_values(leaf), &[(metric, 1.0)]);
        }

        // The program continues; the next sample unwinds fully and roots
        // under the process root.
        mem.stack = full_stack;
        assert_eq!(
            record_sample(&mut td, &mem, &regs, metric, 1.0),
            SampleOutcome::Recorded
        );
        assert_eq!(ctx.stats.samples_segv.load(Ordering::Relaxed), 1);
        assert_eq!(td.bt_buf.frames().len(), 3);
    }

    #[test]
    fn suppressed_threads_record_nothing() {
        let mut config = quiet_config();
        config.ignored_threads = vec![0];
        let (ctx, mut td, mem, regs) = world(config);
        assert_eq!(
            record_sample(&mut td, &mem, &regs, MetricId(0), 1.0),
            SampleOutcome::DroppedFiltered
        );
        assert_eq!(ctx.stats.samples_total.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.stats.samples_filtered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn pc_inside_the_collector_is_dropped() {
        let (ctx, mut td, mem, regs) = world(quiet_config());
        ctx.ignore.insert(0x1200, 0x1280, ModuleId(0));
        assert_eq!(
            record_sample(&mut td, &mem, &regs, MetricId(0), 1.0),
            SampleOutcome::DroppedInCollector
        );
        assert_eq!(
            ctx.stats.samples_blocked_in_collector.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn loadmap_change_between_samples_forks_an_epoch() {
        let (ctx, mut td, mem, regs) = world(quiet_config());
        let metric = MetricId(0);
        record_sample(&mut td, &mem, &regs, metric, 1.0);
        assert_eq!(td.epochs.len(), 1);

        ctx.loadmap.on_map(
            "/lib/late.so".into(),
            0x9000,
            0xa000,
            plain_module_info(0x9000, vec![]),
        );
        record_sample(&mut td, &mem, &regs, metric, 1.0);
        assert_eq!(td.epochs.len(), 2);
        // The new head carries the new generation; the old epoch is intact.
        let gens: Vec<u64> = td.epochs.iter().map(|e| e.loadmap_gen).collect();
        assert_eq!(gens[0], ctx.loadmap.generation());
        assert!(gens[1] < gens[0]);
    }

    #[test]
    fn identical_consecutive_samples_reuse_the_previous_leaf() {
        let mut config = quiet_config();
        config.trampoline = true;
        let (ctx, mut td, mem, regs) = world(config);
        let metric = MetricId(0);
        record_sample(&mut td, &mem, &regs, metric, 1.0);
        let nodes_after_first = td.epochs.current().cct.num_nodes;
        record_sample(&mut td, &mem, &regs, metric, 1.0);
        assert_eq!(td.epochs.current().cct.num_nodes, nodes_after_first);
        assert_eq!(ctx.stats.samples_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stopped_sampling_filters_samples() {
        let (ctx, mut td, mem, regs) = world(quiet_config());
        ctx.sampling_active.store(false, Ordering::Release);
        assert_eq!(
            record_sample(&mut td, &mem, &regs, MetricId(0), 1.0),
            SampleOutcome::DroppedFiltered
        );
        ctx.sampling_active.store(true, Ordering::Release);
        assert_eq!(
            record_sample(&mut td, &mem, &regs, MetricId(0), 1.0),
            SampleOutcome::Recorded
        );
    }
}
