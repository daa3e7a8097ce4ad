//! Interrupt-safe critical sections
//!
//! MLFQ queues, the responder stack, and the PMM bitmaps are touched from
//! task context and from IRQ context. Every such access goes through
//! [`hold_interrupts`], which masks interrupts for the lifetime of the
//! returned guard and restores the previous state on drop. On hosted
//! targets (unit tests) there are no interrupts and the guard is a no-op.

use crate::arch;

/// Guard that keeps interrupts masked while alive.
pub struct InterruptGuard {
    was_enabled: bool,
}

/// Disable interrupts and return a guard restoring the prior state on drop.
pub fn hold_interrupts() -> InterruptGuard {
    let was_enabled = arch::interrupts_enabled();
    if was_enabled {
        // SAFETY: Masking interrupts is always sound; the guard re-enables
        // them when the critical section ends.
        unsafe { arch::disable_interrupts() };
    }
    InterruptGuard { was_enabled }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            // SAFETY: Interrupts were enabled when the guard was taken, so
            // re-enabling restores the caller's state.
            unsafe { arch::enable_interrupts() };
        }
    }
}
