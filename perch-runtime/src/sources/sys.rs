#![allow(unused)]

//! Raw perf-event ABI: attribute layout, event ids, flags and ioctls.

use libc::{c_int, c_ulong, pid_t, syscall, SYS_perf_event_open};

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;

pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const PERF_ATTR_FLAG_FREQ: u64 = 1 << 10;

pub const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
pub const PERF_EVENT_IOC_REFRESH: c_ulong = 0x2402;
pub const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;

pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

/// `fcntl` signal-redirection and fd-ownership constants. Not exposed by
/// libc; values match `asm-generic/fcntl.h`.
pub const F_SETSIG: c_int = 10;
pub const F_SETOWN_EX: c_int = 15;
pub const F_OWNER_TID: c_int = 0;

/// Mirrors libc's (unexposed) `struct f_owner_ex`.
#[repr(C)]
pub struct FOwnerEx {
    pub type_: c_int,
    pub pid: pid_t,
}

/// `struct perf_event_attr` through `aux_watermark`/`sample_max_stack`
/// (ATTR size version 5).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    /// Period in events, or frequency in Hz when `FREQ` is set.
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

pub const PERF_ATTR_SIZE: u32 = std::mem::size_of::<PerfEventAttr>() as u32;

pub unsafe fn perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> c_int {
    syscall(SYS_perf_event_open, attr as *const _, pid, cpu, group_fd, flags) as c_int
}

/// The `_sigpoll` arm of `siginfo_t`, which carries the file descriptor
/// that raised an `F_SETSIG` signal. Not exposed by libc's accessors.
#[repr(C)]
pub struct SigPollInfo {
    pub si_signo: c_int,
    pub si_errno: c_int,
    pub si_code: c_int,
    #[cfg(target_pointer_width = "64")]
    _pad: c_int,
    pub si_band: libc::c_long,
    pub si_fd: c_int,
}

/// Extracts the overflowed counter's fd from a poll-style siginfo.
///
/// # Safety
///
/// `info` must be the siginfo delivered with a signal raised through
/// `F_SETSIG` on a file descriptor.
pub unsafe fn siginfo_fd(info: *const libc::siginfo_t) -> c_int {
    (*(info as *const SigPollInfo)).si_fd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_layout_matches_abi_version_5() {
        assert_eq!(PERF_ATTR_SIZE, 112);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, config), 8);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, flags), 40);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, config1), 56);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, sample_regs_intr), 96);
    }
}
