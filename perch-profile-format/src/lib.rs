//! The binary profile format written by the perch measurement runtime.
//!
//! A profile file holds the call-context data gathered by one thread: a
//! name/value header, then one group of sections per epoch (newest epoch
//! first), then a fixed-size footer which records the byte ranges of the
//! sections so that readers can seek directly instead of scanning.
//!
//! Per-epoch sections, in file order:
//!
//! 1. Load map: the code objects that were mapped while the epoch was live.
//! 2. Calling-context tree: a depth-first pre-order stream of nodes, each
//!    carrying its sparse metric values inline. Node id 0 is the root.
//! 3. Metric table: name, unit, flags and sampling period per metric id.
//! 4. Identity-tuple dictionary: the labels of the hierarchy levels
//!    (host, rank, thread, …) followed by this thread's tuple.
//! 5. Sparse metric index: per metric, the ids of the nodes with a
//!    non-zero value, so per-metric consumers can skip the full tree walk.
//!
//! Every section starts on a [`SECTION_ALIGN`] boundary. All multi-byte
//! integers are big-endian regardless of host byte order; strings are a
//! `u32` byte length followed by the bytes, with no NUL terminator.
//!
//! The footer records one set of section ranges. Files with several epochs
//! are still sequentially parseable ([`reader::ProfileReader::epochs`]);
//! the footer's ranges are those of the last epoch written.

use thiserror::Error;

pub mod reader;
pub mod writer;

/// Last eight bytes of every valid profile file.
pub const FOOTER_MAGIC: u64 = 0x7065_7263_6873_6d31; // "perchsm1"

/// Sections begin on multiples of this many bytes.
pub const SECTION_ALIGN: u64 = 1024;

/// Size of the on-disk footer: ten section offsets plus the magic.
pub const FOOTER_SIZE: u64 = 11 * 8;

/// Well-known header name/value pair names.
pub mod nv {
    pub const PROGRAM: &str = "program";
    pub const PROGRAM_PATH: &str = "program-path";
    pub const JOB_ID: &str = "job-id";
    pub const RANK: &str = "rank";
    pub const THREAD: &str = "thread";
    pub const HOST_ID: &str = "host-id";
    pub const PID: &str = "pid";
    pub const TRACE_MIN_TIME: &str = "trace-min-time";
    pub const TRACE_MAX_TIME: &str = "trace-max-time";
}

/// Identity-tuple level kinds.
pub mod idtuple {
    pub const KIND_HOST: u16 = 1;
    pub const KIND_RANK: u16 = 2;
    pub const KIND_THREAD: u16 = 3;
    pub const KIND_PID: u16 = 4;
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad footer magic {found:#018x}")]
    BadMagic { found: u64 },

    #[error("file too short to hold a footer ({len} bytes)")]
    TooShort { len: u64 },

    #[error("section range [{start}, {end}) is not within the file")]
    BadSectionRange { start: u64, end: u64 },

    #[error("string of {len} bytes exceeds the section that holds it")]
    StringTooLong { len: u32 },

    #[error("string is not valid UTF-8")]
    BadString(#[from] std::string::FromUtf8Error),

    #[error("CCT record {node_id} appears before its parent {parent_id}")]
    OrphanNode { node_id: u32, parent_id: u32 },
}

/// One mapped code object, as recorded in an epoch's load map section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadmapEntry {
    pub id: u16,
    pub name: String,
    pub flags: u32,
}

/// One calling-context-tree node in the pre-order stream.
///
/// `parent_id` of the root (node id 0) is 0. Metric values are sparse:
/// only metrics with a non-zero value at this node are present.
#[derive(Debug, Clone, PartialEq)]
pub struct CctNodeRecord {
    pub node_id: u32,
    pub parent_id: u32,
    pub lm_id: u16,
    pub lm_offset: u64,
    pub metrics: Vec<(u16, f64)>,
}

/// One metric description in an epoch's metric table.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTableEntry {
    pub name: String,
    pub unit: String,
    pub flags: u32,
    pub period: u64,
}

/// The identity-tuple dictionary plus this thread's tuple.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityTuple {
    /// Labels of the hierarchy levels, e.g. `(KIND_HOST, "host")`.
    pub dictionary: Vec<(u16, String)>,
    /// The concrete tuple of this profile, e.g. `(KIND_THREAD, 3)`.
    pub tuple: Vec<(u16, u64)>,
}

/// Per-metric list of node ids with non-zero values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseMetricIndex {
    pub per_metric: Vec<(u16, Vec<u32>)>,
}

/// The fixed-size footer at the end of every profile file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footer {
    pub hdr_start: u64,
    pub hdr_end: u64,
    pub loadmap_start: u64,
    pub loadmap_end: u64,
    pub cct_start: u64,
    pub cct_end: u64,
    pub met_tbl_start: u64,
    pub met_tbl_end: u64,
    pub sm_start: u64,
    pub sm_end: u64,
}

pub(crate) fn align_up(pos: u64) -> u64 {
    pos.div_ceil(SECTION_ALIGN) * SECTION_ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_section_boundaries() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 1024);
        assert_eq!(align_up(1023), 1024);
        assert_eq!(align_up(1024), 1024);
        assert_eq!(align_up(1025), 2048);
    }
}
