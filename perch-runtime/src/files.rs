//! Output file naming and process identity probes.
//!
//! One profile file per (rank, thread) pair lands in the measurement
//! directory, named so that files from every rank of a batch job can share
//! it without collisions.

use std::path::{Path, PathBuf};

pub fn pid() -> u32 {
    std::process::id()
}

pub fn hostid() -> u32 {
    (unsafe { libc::gethostid() }) as u32
}

/// The MPI/batch rank of this process, if a launcher exposed one.
pub fn rank() -> u32 {
    for var in ["PMI_RANK", "OMPI_COMM_WORLD_RANK", "SLURM_PROCID", "PMIX_RANK"] {
        if let Ok(value) = std::env::var(var) {
            if let Ok(rank) = value.trim().parse() {
                return rank;
            }
        }
    }
    0
}

pub fn job_id() -> String {
    for var in ["SLURM_JOB_ID", "PBS_JOBID", "LSB_JOBID"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    String::new()
}

pub fn executable_path() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("unknown"))
}

pub fn executable_name() -> String {
    executable_path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn ensure_out_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn stem(thread: u32) -> String {
    format!(
        "{}-{:06}-{:03}-{:08x}-{}",
        executable_name(),
        rank(),
        thread,
        hostid(),
        pid()
    )
}

pub fn profile_path(out_dir: &Path, thread: u32) -> PathBuf {
    out_dir.join(format!("{}.perch", stem(thread)))
}

pub fn trace_path(out_dir: &Path, thread: u32) -> PathBuf {
    out_dir.join(format!("{}.trace", stem(thread)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_and_trace_share_a_stem() {
        let dir = PathBuf::from("/tmp/out");
        let profile = profile_path(&dir, 3);
        let trace = trace_path(&dir, 3);
        assert_eq!(
            profile.file_stem().unwrap(),
            trace.file_stem().unwrap()
        );
        assert_eq!(profile.extension().unwrap(), "perch");
        assert_eq!(trace.extension().unwrap(), "trace");
        let name = profile.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("-003-"));
        assert!(name.contains(&format!("-{}", pid())));
    }
}
