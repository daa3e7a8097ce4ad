//! Global Descriptor Table

use core::arch::asm;
use core::ptr::addr_of;

use x86::dtables::{lgdt, DescriptorTablePointer};

use crate::interrupts::descriptors::{self, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

static mut GDT: [u64; 5] = [0; 5];

/// Build and load the flat GDT, then reload the segment registers.
pub fn init() {
    // SAFETY: Boot is single threaded; the table is written once before it
    // is loaded, and it is static so the CPU reference stays valid.
    unsafe {
        GDT = descriptors::flat_gdt();
        let ptr = DescriptorTablePointer {
            limit: (core::mem::size_of::<[u64; 5]>() - 1) as u16,
            base: addr_of!(GDT) as *const u64,
        };
        lgdt(&ptr);
        reload_segments();
    }
}

/// Reload CS with a far return and the data segments with plain moves.
///
/// # Safety
///
/// Must run immediately after `lgdt` with the flat GDT in place.
unsafe fn reload_segments() {
    // SAFETY: The selectors reference the freshly loaded flat GDT; the
    // retf lands on the next instruction with the new CS.
    unsafe {
        asm!(
            "push {code}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {data}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            code = const KERNEL_CODE_SELECTOR as u32,
            data = const KERNEL_DATA_SELECTOR as u32,
            out("eax") _,
        );
    }
}
