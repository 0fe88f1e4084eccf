use std::path::PathBuf;

use thiserror::Error;

/// Errors raised outside the sample path. Sample-path failures never take
/// this form; they become counters in [`crate::stats::Stats`].
#[derive(Debug, Error)]
pub enum MeasureError {
    #[error("no sample source accepts event '{0}'")]
    UnsupportedEvent(String),

    #[error("no events requested; set {0}")]
    NoEvents(&'static str),

    #[error("sample source '{source_name}' failed to initialize: {reason}")]
    SourceInit {
        source_name: &'static str,
        reason: String,
    },

    #[error("cannot prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("profile write failed: {0}")]
    Format(#[from] perch_profile_format::FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("measurement already initialized")]
    AlreadyInitialized,
}
