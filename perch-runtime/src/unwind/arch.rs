//! Architecture policy for the unwinder.
//!
//! Everything the stack walker needs to know about the CPU lives here: how
//! to pull the interrupted registers out of a `ucontext_t`, how far to back
//! up a return address so it points into the call instruction, and whether
//! the low bits of a code address are available as a trampoline marker
//! (they are only on architectures that align instructions).

use cfg_if::cfg_if;

use super::RegisterSnapshot;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Backing a return address up by one byte lands inside the call
        /// instruction that produced it.
        pub const RA_DECREMENT: u64 = 1;

        /// x86-64 instructions are byte-aligned, so no bit of a code
        /// address is free to serve as a trampoline marker.
        pub const RA_MARK_BIT: u64 = 0;

        /// # Safety
        ///
        /// `uc` must point to the `ucontext_t` delivered to a signal
        /// handler installed with `SA_SIGINFO`.
        pub unsafe fn register_snapshot(uc: *const libc::ucontext_t) -> RegisterSnapshot {
            let gregs = &(*uc).uc_mcontext.gregs;
            RegisterSnapshot {
                pc: gregs[libc::REG_RIP as usize] as u64,
                sp: gregs[libc::REG_RSP as usize] as u64,
                bp: gregs[libc::REG_RBP as usize] as u64,
                lr: None,
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Instructions are four bytes; backing up one instruction lands
        /// on the branch-and-link itself.
        pub const RA_DECREMENT: u64 = 4;

        /// Four-byte instruction alignment leaves the low bits of a code
        /// address free; bit 0 marks a trampolined return address.
        pub const RA_MARK_BIT: u64 = 1;

        /// # Safety
        ///
        /// `uc` must point to the `ucontext_t` delivered to a signal
        /// handler installed with `SA_SIGINFO`.
        pub unsafe fn register_snapshot(uc: *const libc::ucontext_t) -> RegisterSnapshot {
            let mc = &(*uc).uc_mcontext;
            RegisterSnapshot {
                pc: mc.pc,
                sp: mc.sp,
                bp: mc.regs[29],
                lr: Some(mc.regs[30]),
            }
        }
    } else {
        pub const RA_DECREMENT: u64 = 1;
        pub const RA_MARK_BIT: u64 = 0;

        /// # Safety
        ///
        /// Unsupported architecture; never produces a usable snapshot.
        pub unsafe fn register_snapshot(_uc: *const libc::ucontext_t) -> RegisterSnapshot {
            RegisterSnapshot { pc: 0, sp: 0, bp: 0, lr: None }
        }
    }
}

/// The interrupted program counter, for the in-collector check.
///
/// # Safety
///
/// Same contract as [`register_snapshot`].
pub unsafe fn context_pc(uc: *const libc::ucontext_t) -> u64 {
    register_snapshot(uc).pc
}

/// Whether `ra` carries the trampoline marker on this architecture.
pub fn ra_is_marked(ra: u64) -> bool {
    RA_MARK_BIT != 0 && ra & RA_MARK_BIT != 0
}
