mod cli;

use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use clap::Parser;

use cli::{Action, Opt, RecordArgs, ShowArgs};

fn main() -> ExitCode {
    env_logger::init();
    let opt = Opt::parse();
    match opt.action {
        Action::Record(args) => record(args),
        Action::Show(args) => show(args),
    }
}

/// Environment variable names of the runtime contract. Kept in sync with
/// the runtime's `env` module.
mod runtime_env {
    pub const EVENT_LIST: &str = "PERCH_EVENT_LIST";
    pub const OUT_PATH: &str = "PERCH_OUT_PATH";
    pub const TRACE: &str = "PERCH_TRACE";
    pub const DELAY_SAMPLING: &str = "PERCH_DELAY_SAMPLING";
    pub const IGNORE_THREAD: &str = "PERCH_IGNORE_THREAD";
    pub const ABORT_TIMEOUT: &str = "PERCH_ABORT_TIMEOUT";
    pub const RETAIN_RECURSION: &str = "PERCH_RETAIN_RECURSION";
    pub const PROCESS_FRACTION: &str = "PERCH_PROCESS_FRACTION";
}

fn record(args: RecordArgs) -> ExitCode {
    let runtime_lib = match find_runtime_lib(args.runtime_lib.as_deref()) {
        Some(path) => path,
        None => {
            eprintln!(
                "perch: cannot find libperch_runtime.so; build it or pass --runtime-lib"
            );
            return ExitCode::FAILURE;
        }
    };

    let (program, program_args) = args.command.split_first().expect("clap requires a command");
    let mut command = Command::new(program);
    command.args(program_args);

    command.env(runtime_env::EVENT_LIST, args.event_list());
    command.env(runtime_env::OUT_PATH, &args.output);
    if args.trace {
        command.env(runtime_env::TRACE, "1");
    }
    if args.retain_recursion {
        command.env(runtime_env::RETAIN_RECURSION, "1");
    }
    if args.delay_sampling {
        command.env(runtime_env::DELAY_SAMPLING, "1");
    }
    if let Some(list) = &args.ignore_thread {
        command.env(runtime_env::IGNORE_THREAD, list);
    }
    if let Some(secs) = args.abort_timeout {
        command.env(runtime_env::ABORT_TIMEOUT, secs.to_string());
    }
    if let Some(fraction) = &args.process_fraction {
        command.env(runtime_env::PROCESS_FRACTION, fraction);
    }

    let mut preload = runtime_lib.display().to_string();
    if let Ok(existing) = std::env::var("LD_PRELOAD") {
        if !existing.is_empty() {
            preload = format!("{preload}:{existing}");
        }
    }
    command.env("LD_PRELOAD", preload);

    log::info!(
        "launching {:?} with runtime {:?}, events '{}'",
        program,
        runtime_lib,
        args.event_list()
    );

    match command.status() {
        Ok(status) => match status.code() {
            Some(code) => ExitCode::from(code.clamp(0, 255) as u8),
            // Terminated by a signal.
            None => ExitCode::FAILURE,
        },
        Err(err) => {
            eprintln!("perch: cannot launch {program:?}: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Looks for the runtime library next to the perch executable, then in
/// the build tree layout.
fn find_runtime_lib(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    for candidate in [
        dir.join("libperch_runtime.so"),
        dir.join("../lib/libperch_runtime.so"),
    ] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn show(args: ShowArgs) -> ExitCode {
    match dump_profile(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("perch: cannot read {:?}: {err}", args.file);
            ExitCode::FAILURE
        }
    }
}

fn dump_profile(args: &ShowArgs) -> Result<(), Box<dyn std::error::Error>> {
    let file = std::fs::File::open(&args.file)?;
    let mut reader = perch_profile_format::reader::ProfileReader::new(file)?;

    println!("header:");
    for (name, value) in reader.header()? {
        println!("  {name}: {value}");
    }

    let epochs = reader.epochs()?;
    println!("epochs: {}", epochs.len());
    for (index, epoch) in epochs.iter().enumerate() {
        println!("epoch {index}:");
        println!("  load map ({} modules):", epoch.loadmap.len());
        for entry in &epoch.loadmap {
            println!("    [{:3}] {} (flags {:#x})", entry.id, entry.name, entry.flags);
        }
        println!("  metrics:");
        for (id, metric) in epoch.metric_table.iter().enumerate() {
            let total: f64 = epoch
                .cct
                .iter()
                .flat_map(|node| &node.metrics)
                .filter(|(metric_id, _)| *metric_id == id as u16)
                .map(|&(_, value)| value)
                .sum();
            println!(
                "    [{id}] {} ({}, period {}): total {total}",
                metric.name, metric.unit, metric.period
            );
        }
        println!("  cct: {} nodes", epoch.cct.len());
        if args.nodes {
            for node in &epoch.cct {
                print!(
                    "    node {:6} parent {:6} module {:5} offset {:#10x}",
                    node.node_id, node.parent_id, node.lm_id, node.lm_offset
                );
                if node.metrics.is_empty() {
                    println!();
                } else {
                    println!("  {:?}", node.metrics);
                }
            }
        }
    }
    Ok(())
}
