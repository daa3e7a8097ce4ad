//! i386 protected-mode support
//!
//! Privileged instructions and the descriptor substrate. Everything here
//! assumes ring 0 on a single CPU with the kernel identity-mapped.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod vga;

use core::arch::asm;

use x86::controlregs::{cr0, cr0_write, cr2, cr3_write, Cr0};
use x86::io::inb;

/// Bring up the descriptor substrate: GDT, IDT with the trap stubs, and
/// the PIC remapped clear of the CPU exceptions.
pub fn init() {
    gdt::init();
    idt::init();
    pic::remap();
    log::info!("x86: descriptor tables loaded, PIC remapped to {:#04x}", crate::interrupts::IRQ_BASE_VECTOR);
}

pub fn interrupts_enabled() -> bool {
    let eflags: u32;
    // SAFETY: Reading EFLAGS has no side effects.
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(preserves_flags));
    }
    eflags & (1 << 9) != 0
}

/// # Safety
///
/// Always sound in ring 0.
pub unsafe fn disable_interrupts() {
    // SAFETY: cli in ring 0.
    unsafe { x86::irq::disable() };
}

/// # Safety
///
/// Handlers may run immediately; kernel state must be consistent.
pub unsafe fn enable_interrupts() {
    // SAFETY: sti in ring 0.
    unsafe { x86::irq::enable() };
}

/// Halt forever with interrupts off.
pub fn halt_loop() -> ! {
    // SAFETY: cli+hlt in ring 0; this is the end of the line.
    unsafe {
        x86::irq::disable();
        loop {
            x86::halt();
        }
    }
}

/// Invalidate one TLB entry after an unmap.
pub fn flush_tlb_entry(vaddr: u32) {
    // SAFETY: invlpg is safe for any address in ring 0.
    unsafe { x86::tlb::flush(vaddr as usize) };
}

/// Load `directory` into CR3 and set the paging bit in CR0.
pub fn enable_paging(directory: u32) {
    // SAFETY: The caller passes a fully built kernel directory that
    // identity-maps the executing kernel, so the instruction stream stays
    // mapped across the switch-on.
    unsafe {
        cr3_write(directory as u64);
        let flags = cr0();
        cr0_write(flags | Cr0::CR0_ENABLE_PAGING);
    }
    log::info!("paging enabled, directory at {directory:#010x}");
}

/// Load `directory` into CR3 (address-space switch).
pub fn load_directory(directory: u32) {
    // SAFETY: The directory maps the kernel half, so execution continues.
    unsafe { cr3_write(directory as u64) };
}

/// Faulting address of the most recent page fault.
pub fn fault_address() -> u32 {
    // SAFETY: Reading CR2 has no side effects.
    unsafe { cr2() as u32 }
}

/// Whether the keyboard controller's output buffer is still busy.
pub fn keyboard_controller_busy() -> bool {
    // SAFETY: Port 0x64 is the status port of the 8042 controller.
    (unsafe { inb(0x64) } & 1) != 0
}
