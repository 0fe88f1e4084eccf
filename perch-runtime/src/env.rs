//! The environment-variable contract between the loader and the runtime.
//!
//! The `perch` CLI translates its flags into these variables before it
//! launches the target with the runtime preloaded; the runtime reads them
//! exactly once, into a [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use crate::events::{self, EventSpec};

pub const EVENT_LIST: &str = "PERCH_EVENT_LIST";
pub const OUT_PATH: &str = "PERCH_OUT_PATH";
pub const TRACE: &str = "PERCH_TRACE";
pub const MEMSIZE: &str = "PERCH_MEMSIZE";
pub const LOW_MEMSIZE: &str = "PERCH_LOW_MEMSIZE";
pub const DELAY_SAMPLING: &str = "PERCH_DELAY_SAMPLING";
pub const IGNORE_THREAD: &str = "PERCH_IGNORE_THREAD";
pub const ABORT_TIMEOUT: &str = "PERCH_ABORT_TIMEOUT";
pub const RETAIN_RECURSION: &str = "PERCH_RETAIN_RECURSION";
pub const TRAMPOLINE: &str = "PERCH_TRAMPOLINE";
pub const PROCESS_FRACTION: &str = "PERCH_PROCESS_FRACTION";

pub const DEFAULT_MEMSIZE: usize = 4 * 1024 * 1024;
pub const MIN_LOW_MEMSIZE: usize = 80 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub events: Vec<EventSpec>,
    pub out_dir: PathBuf,
    pub trace: bool,
    pub memsize: usize,
    pub low_memsize: usize,
    pub delay_sampling: bool,
    pub ignored_threads: Vec<u32>,
    pub abort_timeout: Option<Duration>,
    pub retain_recursion: bool,
    pub trampoline: bool,
    pub process_fraction: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            events: Vec::new(),
            out_dir: PathBuf::from("perch-measurements"),
            trace: false,
            memsize: DEFAULT_MEMSIZE,
            low_memsize: default_low_memsize(DEFAULT_MEMSIZE),
            delay_sampling: false,
            ignored_threads: Vec::new(),
            abort_timeout: None,
            retain_recursion: false,
            trampoline: false,
            process_fraction: 1.0,
        }
    }
}

impl Config {
    /// Reads the whole contract from the environment.
    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Ok(list) = std::env::var(EVENT_LIST) {
            config.events = events::parse_event_list(&list);
        }
        if let Ok(dir) = std::env::var(OUT_PATH) {
            if !dir.is_empty() {
                config.out_dir = PathBuf::from(dir);
            }
        }
        config.trace = env_bool(TRACE);
        if let Some(memsize) = env_usize(MEMSIZE) {
            config.memsize = align_to_page(memsize);
        }
        config.low_memsize = env_usize(LOW_MEMSIZE)
            .unwrap_or_else(|| default_low_memsize(config.memsize));
        config.delay_sampling = env_bool(DELAY_SAMPLING);
        if let Ok(list) = std::env::var(IGNORE_THREAD) {
            config.ignored_threads = list
                .split(',')
                .filter_map(|tok| tok.trim().parse().ok())
                .collect();
        }
        config.abort_timeout = env_usize(ABORT_TIMEOUT)
            .filter(|&secs| secs > 0)
            .map(|secs| Duration::from_secs(secs as u64));
        config.retain_recursion = env_bool(RETAIN_RECURSION);
        config.trampoline = env_bool(TRAMPOLINE);
        if let Ok(frac) = std::env::var(PROCESS_FRACTION) {
            if let Some(f) = parse_fraction(&frac) {
                config.process_fraction = f;
            } else {
                log::warn!("ignoring malformed {PROCESS_FRACTION}={frac}");
            }
        }

        config
    }

    pub fn thread_is_ignored(&self, ordinal: u32) -> bool {
        self.ignored_threads.contains(&ordinal)
    }
}

fn default_low_memsize(memsize: usize) -> usize {
    (memsize / 40).max(MIN_LOW_MEMSIZE)
}

fn align_to_page(size: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    size.div_ceil(page) * page
}

fn env_bool(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.as_str(), "" | "0" | "false" | "no"),
        Err(_) => false,
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Accepts either a fraction ("0.1") or a ratio ("1/10").
fn parse_fraction(s: &str) -> Option<f64> {
    let s = s.trim();
    let value = if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        num / den
    } else {
        s.parse().ok()?
    };
    (value > 0.0 && value <= 1.0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_memsize_has_a_floor() {
        assert_eq!(default_low_memsize(DEFAULT_MEMSIZE), 104857); // 4 MiB / 40
        assert_eq!(default_low_memsize(1024), MIN_LOW_MEMSIZE);
    }

    #[test]
    fn fractions_and_ratios_parse() {
        assert_eq!(parse_fraction("0.5"), Some(0.5));
        assert_eq!(parse_fraction("1/10"), Some(0.1));
        assert_eq!(parse_fraction("1.0"), Some(1.0));
        assert_eq!(parse_fraction("0"), None);
        assert_eq!(parse_fraction("2.0"), None);
        assert_eq!(parse_fraction("x"), None);
    }
}
