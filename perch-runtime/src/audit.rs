//! The dynamic-link audit interface.
//!
//! The auditor collaborator (an LD_AUDIT shim or equivalent) tells the
//! runtime when code objects enter and leave the link map, and hands over
//! direct libc entry points so the collector can bypass any interposed
//! wrappers of its own making.

use std::path::PathBuf;

use crate::analysis;
use crate::context::MeasurementContext;
use crate::ip::ModuleId;
use crate::loadmap::{ModuleFlags, ModuleInfo};

/// What the auditor knows about an object as it enters the link map.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
    /// Base address the program headers were loaded at.
    pub phdr_addr: u64,
    pub phdr_count: u16,
}

/// Direct libc entry points, captured before any interposition.
#[derive(Debug, Clone, Copy)]
pub struct LibcExports {
    pub exit: unsafe extern "C" fn(libc::c_int) -> !,
    pub sigaction: unsafe extern "C" fn(
        libc::c_int,
        *const libc::sigaction,
        *mut libc::sigaction,
    ) -> libc::c_int,
    pub sigprocmask: unsafe extern "C" fn(
        libc::c_int,
        *const libc::sigset_t,
        *mut libc::sigset_t,
    ) -> libc::c_int,
    pub pthread_sigmask: unsafe extern "C" fn(
        libc::c_int,
        *const libc::sigset_t,
        *mut libc::sigset_t,
    ) -> libc::c_int,
    pub pthread_self: unsafe extern "C" fn() -> libc::pthread_t,
    pub pthread_kill: unsafe extern "C" fn(libc::pthread_t, libc::c_int) -> libc::c_int,
}

pub fn set_libc_exports(ctx: &MeasurementContext, exports: LibcExports) {
    *ctx.libc_exports.lock() = Some(exports);
}

/// A code object entered the link map.
pub fn on_open(ctx: &MeasurementContext, entry: &AuditEntry) -> ModuleId {
    let info = match analysis::inspect_module(&entry.path, entry.start, entry.end) {
        Ok(info) => info,
        Err(err) => {
            log::warn!(
                "cannot analyze {:?}: {err}; registering without function bounds",
                entry.path
            );
            ModuleInfo {
                bias: entry.start,
                func_bounds: Vec::new(),
                flags: ModuleFlags::RELOCATABLE,
            }
        }
    };
    let mut info = info;
    if is_measurement_runtime(&entry.path) {
        info.flags |= ModuleFlags::CONTAINS_RUNTIME;
    }
    let contains_runtime = info.flags.contains(ModuleFlags::CONTAINS_RUNTIME);
    let id = ctx
        .loadmap
        .on_map(entry.path.clone(), entry.start, entry.end, info);
    if contains_runtime {
        ctx.ignore.insert(entry.start, entry.end, id);
    }
    log::debug!(
        "loadmap: mapped {:?} as module {} at [{:#x}, {:#x})",
        entry.path,
        id.0,
        entry.start,
        entry.end
    );
    id
}

/// A code object left the link map. Its record stays behind.
pub fn on_close(ctx: &MeasurementContext, entry: &AuditEntry) {
    let Some(module) = ctx.loadmap.find_by_addr(entry.start) else {
        return;
    };
    ctx.loadmap.on_unmap(module.id);
    ctx.ignore.remove(module.id);
    log::debug!("loadmap: unmapped module {} ({:?})", module.id.0, entry.path);
}

/// A batch of link-map changes completed. `additive` is true when the
/// batch only added objects.
pub fn on_stable(_ctx: &MeasurementContext, additive: bool) {
    log::trace!("link map stable (additive: {additive})");
}

fn is_measurement_runtime(path: &std::path::Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.contains("perch_runtime") || name.contains("perch-runtime")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Config;

    fn entry(path: &str, start: u64, end: u64) -> AuditEntry {
        AuditEntry {
            path: path.into(),
            start,
            end,
            phdr_addr: start,
            phdr_count: 0,
        }
    }

    #[test]
    fn open_close_cycle_keeps_the_record() {
        let ctx = MeasurementContext::new(Config::default());
        let e = entry("/no/such/lib.so", 0x7f00_0000, 0x7f10_0000);
        let id = on_open(&ctx, &e);
        assert!(ctx.loadmap.find_by_addr(0x7f00_1000).is_some());
        let gen_after_open = ctx.loadmap.generation();

        on_close(&ctx, &e);
        assert!(ctx.loadmap.find_by_addr(0x7f00_1000).is_none());
        assert!(ctx.loadmap.find_by_id(id).is_some());
        assert!(ctx.loadmap.generation() > gen_after_open);
    }

    #[test]
    fn the_runtime_library_is_ignored() {
        let ctx = MeasurementContext::new(Config::default());
        on_open(&ctx, &entry("/opt/lib/libperch_runtime.so", 0x1000, 0x2000));
        assert!(ctx.ignore.contains(0x1800));
        on_open(&ctx, &entry("/usr/lib/libm.so", 0x5000, 0x6000));
        assert!(!ctx.ignore.contains(0x5800));
    }
}
