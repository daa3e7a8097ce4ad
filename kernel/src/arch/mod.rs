//! Architecture support
//!
//! The portable kernel calls through this facade; the `x86` module holds
//! the privileged i386 implementation and only exists on bare-metal
//! builds. Hosted builds (the unit test suite) get no-op stand-ins, so
//! everything above this line stays testable.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    pub fn interrupts_enabled() -> bool {
        super::x86::interrupts_enabled()
    }

    /// # Safety
    ///
    /// Masking interrupts is always sound; pairing with enable is the
    /// caller's job (see `sync::hold_interrupts`).
    pub unsafe fn disable_interrupts() {
        // SAFETY: cli has no preconditions in ring 0.
        unsafe { super::x86::disable_interrupts() }
    }

    /// # Safety
    ///
    /// The caller must only re-enable interrupts when kernel state is
    /// consistent enough for handlers to run.
    pub unsafe fn enable_interrupts() {
        // SAFETY: Forwarded contract.
        unsafe { super::x86::enable_interrupts() }
    }

    pub fn flush_tlb_entry(vaddr: u32) {
        super::x86::flush_tlb_entry(vaddr);
    }

    pub fn halt_loop() -> ! {
        super::x86::halt_loop()
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    pub fn interrupts_enabled() -> bool {
        false
    }

    /// # Safety
    ///
    /// No-op on hosted targets.
    pub unsafe fn disable_interrupts() {}

    /// # Safety
    ///
    /// No-op on hosted targets.
    pub unsafe fn enable_interrupts() {}

    pub fn flush_tlb_entry(_vaddr: u32) {}

    pub fn halt_loop() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}

pub use imp::{disable_interrupts, enable_interrupts, flush_tlb_entry, halt_loop, interrupts_enabled};
