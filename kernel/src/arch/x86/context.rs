//! Context switch primitives
//!
//! The switch works by instruction-pointer surgery: the scheduler path
//! captures its own resume point with [`read_eip`], stores it (plus esp
//! and ebp) in the outgoing TCB, and jumps to the incoming task's saved
//! point with the sentinel in eax. A task that observes the sentinel as
//! the "return value" of `read_eip` knows it was just switched back in.

use core::arch::{asm, global_asm};

/// Value delivered in eax when a task resumes after a switch. A real
/// return address can never equal it: it points into the first,
/// never-mapped page.
pub const RESUME_SENTINEL: u32 = 0x0000_0123;

global_asm!(
    r#"
.global read_eip_inner
read_eip_inner:
    mov eax, [esp]
    ret
"#
);

extern "C" {
    fn read_eip_inner() -> u32;
}

/// The caller's address of the instruction after this call, or
/// [`RESUME_SENTINEL`] when execution arrives here via a context switch.
#[inline(never)]
pub fn read_eip() -> u32 {
    // SAFETY: The asm routine only reads its own return address.
    unsafe { read_eip_inner() }
}

/// Current stack pointer.
pub fn current_esp() -> u32 {
    let esp: u32;
    // SAFETY: Reading esp has no side effects.
    unsafe { asm!("mov {}, esp", out(reg) esp, options(nomem, preserves_flags)) };
    esp
}

/// Current base pointer.
pub fn current_ebp() -> u32 {
    let ebp: u32;
    // SAFETY: Reading ebp has no side effects.
    unsafe { asm!("mov {}, ebp", out(reg) ebp, options(nomem, preserves_flags)) };
    ebp
}

/// Resume a task from its saved context.
///
/// Loads the directory when one is given (0 means keep the current one),
/// installs the saved stack and base pointers, puts the sentinel in eax,
/// re-enables interrupts, and jumps to the saved instruction pointer.
///
/// # Safety
///
/// `esp`/`ebp`/`eip` must come from a context saved by the switch path
/// (or built by task creation), and `cr3` must be 0 or a live directory
/// that maps the kernel.
pub unsafe fn jump_to(esp: u32, ebp: u32, eip: u32, cr3: u32) -> ! {
    // SAFETY: Contract forwarded from the caller; after the stack switch
    // no Rust state of this frame is touched again.
    unsafe {
        asm!(
            "cli",
            "test edx, edx",
            "jz 2f",
            "mov cr3, edx",
            "2:",
            "mov esp, ecx",
            "mov ebp, esi",
            "mov eax, {sentinel}",
            "sti",
            "jmp edi",
            in("ecx") esp,
            in("esi") ebp,
            in("edi") eip,
            in("edx") cr3,
            sentinel = const RESUME_SENTINEL,
            options(noreturn),
        )
    }
}
