//! Backtrace harvesting: drives the unwinder cursor and collects frames.
//!
//! Frames land in a fixed-capacity per-thread buffer carved from the
//! thread's arena at thread-init, so taking a backtrace allocates nothing.
//! Frames are ordered innermost first.

use std::ptr::NonNull;

use crate::arena::Arena;
use crate::ip::NormalizedIp;
use crate::unwind::{AddressSpace, Fence, RegisterSnapshot, StepResult, UnwindAbort, Unwinder};

pub const DEFAULT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub ip_norm: NormalizedIp,
    /// Normalized entry address of the frame's enclosing function.
    pub the_function: NormalizedIp,
    /// Stack address the return address was read from (0 = register).
    pub ra_loc: u64,
    pub ra_val: u64,
}

/// Fixed-capacity frame storage in arena memory.
#[derive(Debug)]
pub struct BacktraceBuffer {
    frames: NonNull<Frame>,
    capacity: usize,
    len: usize,
}

unsafe impl Send for BacktraceBuffer {}

impl BacktraceBuffer {
    pub fn new_in(arena: &Arena, capacity: usize) -> Option<BacktraceBuffer> {
        let bytes = capacity.checked_mul(std::mem::size_of::<Frame>())?;
        let ptr = arena.alloc(bytes)?;
        Some(BacktraceBuffer {
            frames: ptr.cast(),
            capacity,
            len: 0,
        })
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[must_use]
    pub fn push(&mut self, frame: Frame) -> bool {
        if self.len == self.capacity {
            return false;
        }
        unsafe { self.frames.as_ptr().add(self.len).write(frame) };
        self.len += 1;
        true
    }

    pub fn frames(&self) -> &[Frame] {
        unsafe { std::slice::from_raw_parts(self.frames.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// How a walk ended, plus what was collected.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceInfo {
    pub len: usize,
    pub fence: Fence,
    /// The walk did not reach a known bottom frame.
    pub partial: bool,
    /// The walk aborted on a failed memory read.
    pub faulted: bool,
    /// Trolling was needed at least once.
    pub trolled: bool,
    /// A shared structure was contended; the sample should be dropped.
    pub contended: bool,
}

/// Walks the stack described by `regs` into `buf` (innermost first).
pub fn generate_backtrace(
    unwinder: &Unwinder<'_>,
    mem: &dyn AddressSpace,
    regs: &RegisterSnapshot,
    buf: &mut BacktraceBuffer,
) -> BacktraceInfo {
    buf.clear();
    let mut info = BacktraceInfo::default();

    let mut cursor = match unwinder.init_cursor(regs, mem) {
        Ok(cursor) => cursor,
        Err(abort) => {
            info.partial = true;
            info.contended = abort == UnwindAbort::Contended;
            return info;
        }
    };

    loop {
        let pushed = buf.push(Frame {
            ip_norm: cursor.pc_norm,
            the_function: cursor.the_function,
            ra_loc: cursor.ra_loc,
            ra_val: cursor.ra,
        });
        if !pushed {
            info.partial = true;
            break;
        }
        match unwinder.step(&mut cursor, mem) {
            StepResult::Ok => {}
            StepResult::Troll => info.trolled = true,
            StepResult::Stop | StepResult::StopWeak => {
                info.fence = cursor.fence;
                break;
            }
            StepResult::Error => {
                info.partial = true;
                info.faulted = cursor.abort == Some(UnwindAbort::Faulted);
                info.contended = cursor.abort == Some(UnwindAbort::Contended);
                info.fence = Fence::Error;
                break;
            }
        }
    }

    info.len = buf.len();
    info
}
