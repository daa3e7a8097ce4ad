//! Interrupt Descriptor Table and trap stubs
//!
//! Every installed vector funnels through one common stub that freezes
//! the register state into an `InterruptFrame`, calls the portable
//! dispatcher, signals end-of-interrupt for hardware IRQs, and finally
//! runs any context switch the timer tick deferred.

use core::arch::global_asm;
use core::ptr::addr_of;

use x86::dtables::{lidt, DescriptorTablePointer};

use crate::interrupts::descriptors::{interrupt_gate, trap_gate, KERNEL_CODE_SELECTOR};
use crate::interrupts::{InterruptFrame, IRQ_BASE_VECTOR, VECTOR_SYSCALL, VECTOR_TIMER};

// Stubs for vectors 0x00-0x2F plus the syscall gate. The CPU pushes an
// error code only for some exceptions; the others push a dummy 0 so the
// frame layout is uniform.
global_asm!(
    r#"
.macro ISR_NOERR num
.global isr\num
isr\num:
    push 0
    push \num
    jmp isr_common
.endm

.macro ISR_ERR num
.global isr\num
isr\num:
    push \num
    jmp isr_common
.endm

ISR_NOERR 0
ISR_NOERR 1
ISR_NOERR 2
ISR_NOERR 3
ISR_NOERR 4
ISR_NOERR 5
ISR_NOERR 6
ISR_NOERR 7
ISR_ERR   8
ISR_NOERR 9
ISR_ERR   10
ISR_ERR   11
ISR_ERR   12
ISR_ERR   13
ISR_ERR   14
ISR_NOERR 15
ISR_NOERR 16
ISR_ERR   17
ISR_NOERR 18
ISR_NOERR 19
ISR_NOERR 20
ISR_ERR   21
ISR_NOERR 22
ISR_NOERR 23
ISR_NOERR 24
ISR_NOERR 25
ISR_NOERR 26
ISR_NOERR 27
ISR_NOERR 28
ISR_NOERR 29
ISR_ERR   30
ISR_NOERR 31
ISR_NOERR 32
ISR_NOERR 33
ISR_NOERR 34
ISR_NOERR 35
ISR_NOERR 36
ISR_NOERR 37
ISR_NOERR 38
ISR_NOERR 39
ISR_NOERR 40
ISR_NOERR 41
ISR_NOERR 42
ISR_NOERR 43
ISR_NOERR 44
ISR_NOERR 45
ISR_NOERR 46
ISR_NOERR 47
ISR_NOERR 128

isr_common:
    pusha
    push ds
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    push esp
    call isr_dispatch
    add esp, 4
    pop eax
    mov ds, ax
    mov es, ax
    popa
    add esp, 8
    iretd

.global ISR_STUB_TABLE
ISR_STUB_TABLE:
    .long isr0,  isr1,  isr2,  isr3,  isr4,  isr5,  isr6,  isr7
    .long isr8,  isr9,  isr10, isr11, isr12, isr13, isr14, isr15
    .long isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23
    .long isr24, isr25, isr26, isr27, isr28, isr29, isr30, isr31
    .long isr32, isr33, isr34, isr35, isr36, isr37, isr38, isr39
    .long isr40, isr41, isr42, isr43, isr44, isr45, isr46, isr47
    .long isr128
"#
);

extern "C" {
    static ISR_STUB_TABLE: [u32; 49];
}

static mut IDT: [u64; 256] = [0; 256];

/// Build the IDT from the stub table and load it.
pub fn init() {
    // SAFETY: Boot is single threaded; the table is fully written before
    // lidt, and static storage keeps the CPU reference valid.
    unsafe {
        for (i, &stub) in ISR_STUB_TABLE[..48].iter().enumerate() {
            IDT[i] = interrupt_gate(stub, KERNEL_CODE_SELECTOR, 0);
        }
        // Future syscall gate: reachable from ring 3, interrupts stay on.
        IDT[VECTOR_SYSCALL as usize] = trap_gate(ISR_STUB_TABLE[48], KERNEL_CODE_SELECTOR, 3);

        let ptr = DescriptorTablePointer {
            limit: (core::mem::size_of::<[u64; 256]>() - 1) as u16,
            base: addr_of!(IDT) as *const u64,
        };
        lidt(&ptr);
    }
}

/// Common trap entry: dispatch, acknowledge, then honor a deferred
/// preemption (never inside the handler, always after EOI).
#[no_mangle]
extern "C" fn isr_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: The stub passes a pointer to the frame it just pushed on
    // this stack; it stays valid for the duration of the call.
    let frame = unsafe { &mut *frame };

    crate::interrupts::dispatch(frame);

    let vector = frame.vector as u8;
    if (IRQ_BASE_VECTOR..IRQ_BASE_VECTOR + 16).contains(&vector) {
        super::pic::end_of_interrupt(vector);
        if vector == VECTOR_TIMER {
            crate::task::switch::run_pending_switch();
        }
    }
}
