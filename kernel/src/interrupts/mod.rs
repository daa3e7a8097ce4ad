//! Interrupt dispatch
//!
//! The descriptor substrate (GDT/IDT/PIC) lives in the arch layer; this
//! module owns the architecture-independent half: the vector map, the
//! handler registration table, and the dispatcher the common trap stub
//! calls with a frozen register frame. Handlers may modify the frame; it
//! is restored wholesale on IRET.

pub mod descriptors;

use spin::Mutex;

// ---------------------------------------------------------------------------
// Vector map
// ---------------------------------------------------------------------------

/// CPU exception vectors occupy 0x00-0x1F.
pub const EXCEPTION_COUNT: usize = 32;

/// Page fault exception vector.
pub const VECTOR_PAGE_FAULT: u8 = 14;

/// The PIC is remapped so IRQs start here, clear of the exceptions.
pub const IRQ_BASE_VECTOR: u8 = 0x20;

/// PIT channel 0 (IRQ 0).
pub const VECTOR_TIMER: u8 = 0x20;

/// Keyboard (IRQ 1).
pub const VECTOR_KEYBOARD: u8 = 0x21;

/// PS/2 mouse (IRQ 12).
pub const VECTOR_MOUSE: u8 = 0x2C;

/// Reserved for a future syscall gate.
pub const VECTOR_SYSCALL: u8 = 0x80;

/// Names for the architecture-defined exceptions.
pub const EXCEPTION_NAMES: [&str; EXCEPTION_COUNT] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point error",
    "virtualization error",
    "control protection error",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication error",
    "security error",
    "reserved",
];

// ---------------------------------------------------------------------------
// Register frame
// ---------------------------------------------------------------------------

/// The register frame the common stub pushes before dispatch, in push
/// order from last to first. The frame (possibly modified by the handler)
/// is restored on IRET.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    /// Saved data segment selector.
    pub ds: u32,
    // pusha order
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    /// Vector number pushed by the stub.
    pub vector: u32,
    /// Hardware error code, or 0 for vectors without one.
    pub error_code: u32,
    // iret frame
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only valid on a privilege-level change.
    pub user_esp: u32,
    pub ss: u32,
}

/// An interrupt handler: runs with interrupts masked, must not block and
/// must not allocate from the kernel heap.
pub type InterruptHandler = fn(&mut InterruptFrame);

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

struct HandlerTable {
    handlers: [Option<InterruptHandler>; 256],
}

static HANDLERS: Mutex<HandlerTable> = Mutex::new(HandlerTable {
    handlers: [None; 256],
});

// There is one CPU, so one flag suffices on bare metal. The host test
// harness runs tests on several threads; a thread-local keeps one test's
// simulated dispatch from leaking into another's assertions.
#[cfg(target_os = "none")]
mod context_flag {
    use core::sync::atomic::{AtomicBool, Ordering};

    static IN_INTERRUPT: AtomicBool = AtomicBool::new(false);

    pub(super) fn set(value: bool) {
        IN_INTERRUPT.store(value, Ordering::Relaxed);
    }

    pub(super) fn get() -> bool {
        IN_INTERRUPT.load(Ordering::Relaxed)
    }
}

#[cfg(not(target_os = "none"))]
mod context_flag {
    use core::cell::Cell;

    std::thread_local! {
        static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    }

    pub(super) fn set(value: bool) {
        IN_INTERRUPT.with(|flag| flag.set(value));
    }

    pub(super) fn get() -> bool {
        IN_INTERRUPT.with(|flag| flag.get())
    }
}

/// True while the dispatcher is running a handler.
pub fn in_interrupt_context() -> bool {
    context_flag::get()
}

/// Register `handler` for `vector`, replacing any previous registration.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    let _guard = crate::sync::hold_interrupts();
    let mut table = HANDLERS.lock();
    if table.handlers[vector as usize].is_some() {
        log::warn!("replacing handler for vector {vector:#04x}");
    }
    table.handlers[vector as usize] = Some(handler);
}

/// Remove the registration for `vector`.
pub fn unregister_handler(vector: u8) {
    let _guard = crate::sync::hold_interrupts();
    HANDLERS.lock().handlers[vector as usize] = None;
}

/// Dispatch a trap to its registered handler.
///
/// An unhandled CPU exception is fatal; an unhandled hardware interrupt is
/// logged and dropped.
pub fn dispatch(frame: &mut InterruptFrame) {
    context_flag::set(true);

    let handler = HANDLERS.lock().handlers[frame.vector as usize];
    match handler {
        Some(h) => h(frame),
        None if (frame.vector as usize) < EXCEPTION_COUNT => {
            context_flag::set(false);
            panic!(
                "unhandled CPU exception {} ({}) at eip {:#010x}, error code {:#x}",
                frame.vector, EXCEPTION_NAMES[frame.vector as usize], frame.eip, frame.error_code
            );
        }
        None => {
            log::warn!("unhandled interrupt vector {:#04x}", frame.vector);
        }
    }

    context_flag::set(false);
}
