//! Bridges a thread's in-memory epochs to the on-disk profile format.
//!
//! The profile file opens lazily on the first write-out, which happens in
//! one of two places: a low-memory flush (epochs are written, the arena's
//! freeable half reclaimed, and accumulation restarts in a fresh epoch) or
//! thread finalization (remaining epochs are written and the footer
//! sealed). Both append to the same `ProfileWriter`, so a flushed-then-
//! finalized file carries every epoch in order and a sequential reader
//! sees the same aggregate tree a single finalize would have produced.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{BigEndian, WriteBytesExt};
use perch_profile_format::writer::ProfileWriter;
use perch_profile_format::{
    idtuple, nv, CctNodeRecord, IdentityTuple, LoadmapEntry, MetricTableEntry, SparseMetricIndex,
};

use crate::context::MeasurementContext;
use crate::epoch::Epoch;
use crate::error::MeasureError;
use crate::files;
use crate::thread_data::ThreadData;

/// Sidecar trace stream: `(timestamp_ns: u64, node_id: u32)` records,
/// big-endian, appended as samples arrive.
#[derive(Debug)]
pub struct TraceWriter {
    file: File,
    pub min_time: u64,
    pub max_time: u64,
    pub records: u64,
}

impl TraceWriter {
    pub fn create(path: &Path) -> std::io::Result<TraceWriter> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(TraceWriter {
            file: File::create(path)?,
            min_time: u64::MAX,
            max_time: 0,
            records: 0,
        })
    }

    pub fn emit(&mut self, timestamp_ns: u64, node_id: u32) -> std::io::Result<()> {
        self.file.write_u64::<BigEndian>(timestamp_ns)?;
        self.file.write_u32::<BigEndian>(node_id)?;
        self.min_time = self.min_time.min(timestamp_ns);
        self.max_time = self.max_time.max(timestamp_ns);
        self.records += 1;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Writes all current epochs; seals the footer when `finalize` is set.
pub fn write_epochs(td: &mut ThreadData, finalize: bool) -> Result<(), MeasureError> {
    let ctx = td.ctx.clone();
    if !ctx.recording || ctx.config.thread_is_ignored(td.ordinal) {
        return Ok(());
    }

    if td.writer.is_none() {
        let out_dir = &ctx.config.out_dir;
        files::ensure_out_dir(out_dir).map_err(|source| MeasureError::OutputDir {
            path: out_dir.clone(),
            source,
        })?;
        let file = File::create(files::profile_path(out_dir, td.ordinal))?;
        let mut writer = ProfileWriter::new(file);
        writer.write_header(&header_pairs(td))?;
        td.writer = Some(writer);
    }
    let mut writer = td.writer.take().expect("writer was just created");

    let result = (|| -> Result<(), MeasureError> {
        for epoch in td.epochs.iter() {
            let (loadmap, nodes, sparse) = collect_epoch_sections(&ctx, epoch);
            writer.write_loadmap(&loadmap)?;
            writer.write_cct(nodes.into_iter())?;
            writer.write_metric_table(&metric_table(&ctx))?;
            writer.write_identity_tuple(&identity_tuple(td.ordinal))?;
            writer.write_sparse_index(&sparse)?;
        }
        Ok(())
    })();
    result?;

    if finalize {
        let mut file = writer.finish()?;
        file.flush()?;
        td.written.set(true);
    } else {
        td.writer = Some(writer);
    }
    Ok(())
}

/// Low-memory flush: write what we have, reclaim the CCT storage, and
/// restart accumulation in a single fresh epoch.
pub fn flush(td: &mut ThreadData) {
    if td.written.get() {
        return;
    }
    if write_epochs(td, false).is_err() {
        // May run in signal context; no logging machinery here.
        let msg = b"perch: epoch flush failed, dropping accumulated samples\n";
        unsafe { libc::write(2, msg.as_ptr().cast(), msg.len()) };
    }
    td.arena.reclaim_freeable();
    let generation = td.ctx.loadmap.generation();
    if !td.epochs.reset(&td.arena, generation) {
        td.sampling_disabled.set(true);
    }
    td.tramp.invalidate();
}

/// Thread finalization: write everything and seal the file.
pub fn finalize_thread(td: &mut ThreadData) -> Result<(), MeasureError> {
    if td.written.get() {
        return Ok(());
    }
    td.suppressed.set(true);
    write_epochs(td, true)?;
    if let Some(trace) = td.trace.take() {
        let _ = trace.finish();
    }
    Ok(())
}

fn header_pairs(td: &ThreadData) -> Vec<(String, String)> {
    let (trace_min, trace_max) = match &td.trace {
        Some(trace) if trace.records > 0 => (trace.min_time, trace.max_time),
        _ => (0, 0),
    };
    vec![
        (nv::PROGRAM.into(), files::executable_name()),
        (
            nv::PROGRAM_PATH.into(),
            files::executable_path().display().to_string(),
        ),
        (nv::JOB_ID.into(), files::job_id()),
        (nv::RANK.into(), files::rank().to_string()),
        (nv::THREAD.into(), td.ordinal.to_string()),
        (nv::HOST_ID.into(), format!("{:08x}", files::hostid())),
        (nv::PID.into(), files::pid().to_string()),
        (nv::TRACE_MIN_TIME.into(), trace_min.to_string()),
        (nv::TRACE_MAX_TIME.into(), trace_max.to_string()),
    ]
}

fn collect_epoch_sections(
    ctx: &MeasurementContext,
    epoch: &Epoch,
) -> (Vec<LoadmapEntry>, Vec<CctNodeRecord>, SparseMetricIndex) {
    let loadmap = ctx
        .loadmap
        .modules_created_through(epoch.loadmap_gen)
        .iter()
        .map(|module| LoadmapEntry {
            id: module.id.0,
            name: module.path.display().to_string(),
            flags: module.flags.bits(),
        })
        .collect();

    let bundle = &epoch.cct;
    let mut nodes = Vec::with_capacity(bundle.num_nodes as usize);
    let mut per_metric: Vec<(u16, Vec<u32>)> = Vec::new();
    bundle.walk_preorder(bundle.top, &mut |node| {
        let parent_id = if node.parent.is_null() {
            0
        } else {
            bundle.node(node.parent).persistent_id
        };
        let metrics: Vec<(u16, f64)> = node
            .metrics()
            .iter()
            .map(|&(id, value)| (id.0, value))
            .collect();
        for &(metric_id, _) in &metrics {
            match per_metric.iter_mut().find(|(id, _)| *id == metric_id) {
                Some((_, node_ids)) => node_ids.push(node.persistent_id),
                None => per_metric.push((metric_id, vec![node.persistent_id])),
            }
        }
        nodes.push(CctNodeRecord {
            node_id: node.persistent_id,
            parent_id,
            lm_id: node.addr.module.0,
            lm_offset: node.addr.offset,
            metrics,
        });
    });
    per_metric.sort_unstable_by_key(|&(id, _)| id);

    (loadmap, nodes, SparseMetricIndex { per_metric })
}

fn metric_table(ctx: &MeasurementContext) -> Vec<MetricTableEntry> {
    ctx.metrics
        .snapshot()
        .into_iter()
        .map(|desc| MetricTableEntry {
            name: desc.name,
            unit: desc.unit.to_string(),
            flags: desc.flags.bits(),
            period: desc.period,
        })
        .collect()
}

fn identity_tuple(thread: u32) -> IdentityTuple {
    IdentityTuple {
        dictionary: vec![
            (idtuple::KIND_HOST, "host".into()),
            (idtuple::KIND_RANK, "rank".into()),
            (idtuple::KIND_THREAD, "thread".into()),
            (idtuple::KIND_PID, "pid".into()),
        ],
        tuple: vec![
            (idtuple::KIND_HOST, files::hostid() as u64),
            (idtuple::KIND_RANK, files::rank() as u64),
            (idtuple::KIND_THREAD, thread as u64),
            (idtuple::KIND_PID, files::pid() as u64),
        ],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;

    use perch_profile_format::reader::ProfileReader;

    use super::*;
    use crate::backtrace::Frame;
    use crate::env::Config;
    use crate::ip::{ModuleId, NormalizedIp};
    use crate::loadmap::{ModuleFlags, ModuleInfo};
    use crate::metrics::{MetricFlags, MetricId};

    fn world(out_dir: &Path, config_tweak: impl FnOnce(&mut Config)) -> Box<ThreadData> {
        let mut config = Config::default();
        config.out_dir = out_dir.to_path_buf();
        config_tweak(&mut config);
        let ctx = MeasurementContext::new(config);
        ctx.loadmap.on_map(
            "/bin/app".into(),
            0x1000,
            0x2000,
            ModuleInfo {
                bias: 0x1000,
                func_bounds: vec![],
                flags: ModuleFlags::RELOCATABLE,
            },
        );
        ctx.metrics
            .register("CPUTIME", "us", 5000, MetricFlags::ASYNC);
        let ordinal = ctx.next_thread_ordinal();
        ThreadData::new(ctx, ordinal).unwrap()
    }

    fn frame(offset: u64, func: u64) -> Frame {
        Frame {
            ip_norm: NormalizedIp::new(ModuleId(0), offset),
            the_function: NormalizedIp::new(ModuleId(0), func),
            ra_loc: 0,
            ra_val: 0,
        }
    }

    /// Innermost-first main -> f -> g.
    fn linear_frames() -> Vec<Frame> {
        vec![
            frame(0x240, 0x200),
            frame(0x13f, 0x100),
            frame(0x03f, 0x000),
        ]
    }

    fn sample_once(td: &mut ThreadData, frames: &[Frame], value: f64) {
        let epoch = td.epochs.current();
        let top = epoch.cct.top;
        let leaf = epoch
            .cct
            .insert_backtrace(&td.arena, top, frames, true)
            .unwrap();
        assert!(epoch.cct.add_metric(&td.arena, leaf, MetricId(0), value));
    }

    /// Per-path metric-0 totals across every epoch in the file, keyed by
    /// the normalized path from the root.
    fn aggregate_metric0(path: &Path) -> HashMap<Vec<(u16, u64)>, f64> {
        let file = std::fs::File::open(path).unwrap();
        let mut reader = ProfileReader::new(file).unwrap();
        let mut totals = HashMap::new();
        for epoch in reader.epochs().unwrap() {
            let by_id: HashMap<u32, &perch_profile_format::CctNodeRecord> =
                epoch.cct.iter().map(|n| (n.node_id, n)).collect();
            for node in &epoch.cct {
                let Some(&(_, value)) = node.metrics.iter().find(|&&(id, _)| id == 0) else {
                    continue;
                };
                let mut path_key = Vec::new();
                let mut cursor = node;
                loop {
                    path_key.push((cursor.lm_id, cursor.lm_offset));
                    if cursor.node_id == 0 {
                        break;
                    }
                    cursor = by_id[&cursor.parent_id];
                }
                path_key.reverse();
                *totals.entry(path_key).or_insert(0.0) += value;
            }
        }
        totals
    }

    #[test]
    fn round_trip_preserves_tree_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut td = world(dir.path(), |_| {});
        let frames = linear_frames();
        for _ in 0..10 {
            sample_once(&mut td, &frames, 1.0);
        }
        let expected_nodes = td.epochs.current().cct.num_nodes;
        finalize_thread(&mut td).unwrap();
        assert!(td.written.get());

        let path = files::profile_path(dir.path(), 0);
        let mut reader = ProfileReader::new(std::fs::File::open(&path).unwrap()).unwrap();

        let header: HashMap<String, String> = reader.header().unwrap().into_iter().collect();
        assert_eq!(header["pid"], files::pid().to_string());
        assert_eq!(header["thread"], "0");

        let loadmap = reader.loadmap().unwrap();
        assert_eq!(loadmap.len(), 1);
        assert_eq!(loadmap[0].name, "/bin/app");

        let nodes = reader.cct().unwrap();
        assert_eq!(nodes.len() as u32, expected_nodes);
        assert_eq!(nodes[0].node_id, 0);

        // Exactly one node carries metrics: the leaf, with 10 x 1.0.
        let with_metrics: Vec<_> = nodes.iter().filter(|n| !n.metrics.is_empty()).collect();
        assert_eq!(with_metrics.len(), 1);
        let leaf = with_metrics[0];
        assert_eq!(leaf.metrics, vec![(0, 10.0)]);
        assert_eq!(leaf.lm_offset, 0x240);

        // The chain below the root matches what was inserted.
        let by_id: HashMap<u32, _> = nodes.iter().map(|n| (n.node_id, n)).collect();
        let f = by_id[&leaf.parent_id];
        assert_eq!(f.lm_offset, 0x13f);
        let main = by_id[&f.parent_id];
        assert_eq!(main.lm_offset, 0x03f);
        assert_eq!(main.parent_id, 0);

        assert_eq!(reader.metric_table().unwrap()[0].name, "CPUTIME");
        assert_eq!(
            reader.sparse_index().unwrap().per_metric,
            vec![(0, vec![leaf.node_id])]
        );
        let idt = reader.identity_tuple().unwrap();
        assert_eq!(idt.dictionary.len(), 4);
    }

    #[test]
    fn dlopen_between_samples_yields_two_epochs_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut td = world(dir.path(), |_| {});
        sample_once(&mut td, &linear_frames(), 1.0);

        let ctx = td.ctx.clone();
        let late = ctx.loadmap.on_map(
            "/lib/late.so".into(),
            0x9000,
            0xa000,
            ModuleInfo {
                bias: 0x9000,
                func_bounds: vec![],
                flags: ModuleFlags::RELOCATABLE,
            },
        );
        td.epochs
            .ensure_current(&td.arena, ctx.loadmap.generation())
            .unwrap();
        sample_once(&mut td, &linear_frames(), 1.0);
        finalize_thread(&mut td).unwrap();

        let path = files::profile_path(dir.path(), 0);
        let mut reader = ProfileReader::new(std::fs::File::open(&path).unwrap()).unwrap();
        let epochs = reader.epochs().unwrap();
        assert_eq!(epochs.len(), 2);
        // Newest epoch first: it knows the late module, the old one does not.
        let newest_ids: Vec<u16> = epochs[0].loadmap.iter().map(|e| e.id).collect();
        let oldest_ids: Vec<u16> = epochs[1].loadmap.iter().map(|e| e.id).collect();
        assert!(newest_ids.contains(&late.0));
        assert!(!oldest_ids.contains(&late.0));
    }

    #[test]
    fn flush_then_finalize_matches_a_single_finalize() {
        let dir_a = tempfile::tempdir().unwrap();
        let mut td = world(dir_a.path(), |_| {});
        sample_once(&mut td, &linear_frames(), 1.0);
        sample_once(&mut td, &linear_frames(), 1.0);
        flush(&mut td);
        assert!(!td.written.get());
        sample_once(&mut td, &linear_frames(), 1.0);
        sample_once(&mut td, &linear_frames(), 1.0);
        finalize_thread(&mut td).unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let mut td = world(dir_b.path(), |_| {});
        for _ in 0..4 {
            sample_once(&mut td, &linear_frames(), 1.0);
        }
        finalize_thread(&mut td).unwrap();

        let flushed = aggregate_metric0(&files::profile_path(dir_a.path(), 0));
        let single = aggregate_metric0(&files::profile_path(dir_b.path(), 0));
        assert_eq!(flushed, single);
        assert_eq!(flushed.values().sum::<f64>(), 4.0);
    }

    #[test]
    fn ignored_threads_write_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut td = world(dir.path(), |config| config.ignored_threads = vec![0]);
        sample_once(&mut td, &linear_frames(), 1.0);
        finalize_thread(&mut td).unwrap();
        assert!(!files::profile_path(dir.path(), 0).exists());
    }

    #[test]
    fn finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut td = world(dir.path(), |_| {});
        sample_once(&mut td, &linear_frames(), 1.0);
        finalize_thread(&mut td).unwrap();
        let len_after_first = std::fs::metadata(files::profile_path(dir.path(), 0))
            .unwrap()
            .len();
        finalize_thread(&mut td).unwrap();
        let len_after_second = std::fs::metadata(files::profile_path(dir.path(), 0))
            .unwrap()
            .len();
        assert_eq!(len_after_first, len_after_second);
    }
}

