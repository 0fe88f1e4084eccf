use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "perch",
    version,
    about = r#"
perch is a sampling call-path profiler for unmodified Linux binaries.

EXAMPLES:
    # Profile a command on CPU time, 5 ms period:
    perch record -e CPUTIME@5000 -- ./yourcommand yourargs

    # Profile on hardware cycles at 300 Hz, with tracing:
    perch record -e cycles@f300 -t -o measurements -- ./yourcommand

    # Inspect a recorded profile:
    perch show measurements/yourcommand-000000-000-00c0ffee-4242.perch
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Launch a command with the measurement runtime preloaded.
    Record(RecordArgs),

    /// Dump the contents of a recorded profile file.
    Show(ShowArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Event to sample, as NAME, NAME@PERIOD or NAME@fFREQ. Repeatable.
    #[arg(short = 'e', long = "event")]
    pub events: Vec<String>,

    /// Directory for the per-thread profile files.
    #[arg(short = 'o', long = "output", default_value = "perch-measurements")]
    pub output: PathBuf,

    /// Also write per-thread trace files.
    #[arg(short = 't', long = "trace")]
    pub trace: bool,

    /// Keep every level of recursive call chains instead of folding.
    #[arg(long)]
    pub retain_recursion: bool,

    /// Start with sampling suppressed; the target resumes it through the
    /// start-stop API.
    #[arg(long)]
    pub delay_sampling: bool,

    /// Comma-separated thread ordinals to exclude from profiling.
    #[arg(long, value_name = "LIST")]
    pub ignore_thread: Option<String>,

    /// Abort the run (flushing profiles) after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    pub abort_timeout: Option<u64>,

    /// Fraction of processes that record, e.g. 0.1 or 1/10.
    #[arg(long, value_name = "FRACTION")]
    pub process_fraction: Option<String>,

    /// Path to the measurement runtime library; discovered next to the
    /// perch executable when not given.
    #[arg(long, value_name = "PATH")]
    pub runtime_lib: Option<PathBuf>,

    /// The command to profile and its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Path to a .perch profile file.
    pub file: PathBuf,

    /// Also dump every CCT node.
    #[arg(long)]
    pub nodes: bool,
}

impl RecordArgs {
    /// The event-list string handed to the runtime; CPU time sampling is
    /// the default when no event is requested.
    pub fn event_list(&self) -> String {
        if self.events.is_empty() {
            "CPUTIME".to_string()
        } else {
            self.events.join(";")
        }
    }
}
