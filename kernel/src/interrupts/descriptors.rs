//! GDT and IDT descriptor encoding
//!
//! Pure encoders for the i386 descriptor formats. The arch layer builds
//! its tables from these and loads them with `lgdt`/`lidt`; keeping the
//! bit-packing here lets it be checked without the hardware.

/// Kernel code segment selector (GDT slot 1).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Kernel data segment selector (GDT slot 2).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// User code segment selector (GDT slot 3, RPL 3).
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;

/// User data segment selector (GDT slot 4, RPL 3).
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

// Access byte bits.
const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_CODE_DATA: u8 = 1 << 4;
const ACCESS_EXECUTABLE: u8 = 1 << 3;
const ACCESS_READ_WRITE: u8 = 1 << 1;

// Granularity nibble bits.
const FLAG_4K_GRANULARITY: u8 = 1 << 3;
const FLAG_32_BIT: u8 = 1 << 2;

/// Encode a segment descriptor.
///
/// `limit` is in granularity units (pages when [`FLAG_4K_GRANULARITY`] is
/// set) and only its low 20 bits are representable.
pub fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | (base & 0xFFFF) << 16
        | (base >> 16 & 0xFF) << 32
        | (access as u64) << 40
        | (limit >> 16 & 0xF) << 48
        | (flags as u64 & 0xF) << 52
        | (base >> 24 & 0xFF) << 56
}

/// Access byte for a flat ring-`dpl` code segment.
pub const fn code_access(dpl: u8) -> u8 {
    ACCESS_PRESENT | (dpl & 3) << 5 | ACCESS_CODE_DATA | ACCESS_EXECUTABLE | ACCESS_READ_WRITE
}

/// Access byte for a flat ring-`dpl` data segment.
pub const fn data_access(dpl: u8) -> u8 {
    ACCESS_PRESENT | (dpl & 3) << 5 | ACCESS_CODE_DATA | ACCESS_READ_WRITE
}

/// Flags nibble for a flat 4 GiB 32-bit segment.
pub const fn flat_flags() -> u8 {
    FLAG_4K_GRANULARITY | FLAG_32_BIT
}

/// The five-entry flat GDT: null, kernel code/data, user code/data.
pub fn flat_gdt() -> [u64; 5] {
    [
        0,
        segment_descriptor(0, 0xFFFFF, code_access(0), flat_flags()),
        segment_descriptor(0, 0xFFFFF, data_access(0), flat_flags()),
        segment_descriptor(0, 0xFFFFF, code_access(3), flat_flags()),
        segment_descriptor(0, 0xFFFFF, data_access(3), flat_flags()),
    ]
}

const GATE_INTERRUPT_32: u8 = 0xE;
const GATE_TRAP_32: u8 = 0xF;

fn gate(offset: u32, selector: u16, dpl: u8, kind: u8) -> u64 {
    let offset = offset as u64;
    let type_attr = ACCESS_PRESENT | (dpl & 3) << 5 | kind;
    (offset & 0xFFFF)
        | (selector as u64) << 16
        | (type_attr as u64) << 40
        | (offset >> 16 & 0xFFFF) << 48
}

/// Encode a 32-bit interrupt gate (interrupts masked on entry).
pub fn interrupt_gate(offset: u32, selector: u16, dpl: u8) -> u64 {
    gate(offset, selector, dpl, GATE_INTERRUPT_32)
}

/// Encode a 32-bit trap gate (interrupts left as-is on entry).
pub fn trap_gate(offset: u32, selector: u16, dpl: u8) -> u64 {
    gate(offset, selector, dpl, GATE_TRAP_32)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_flat_kernel_code_descriptor() {
        // Base 0, limit 0xFFFFF pages, present|code|rw ring 0, 4K 32-bit.
        let d = segment_descriptor(0, 0xFFFFF, code_access(0), flat_flags());
        assert_eq!(d, 0x00CF_9A00_0000_FFFF);
    }

    #[test]
    fn test_flat_kernel_data_descriptor() {
        let d = segment_descriptor(0, 0xFFFFF, data_access(0), flat_flags());
        assert_eq!(d, 0x00CF_9200_0000_FFFF);
    }

    #[test]
    fn test_user_descriptors_carry_dpl3() {
        let code = segment_descriptor(0, 0xFFFFF, code_access(3), flat_flags());
        let data = segment_descriptor(0, 0xFFFFF, data_access(3), flat_flags());
        assert_eq!(code, 0x00CF_FA00_0000_FFFF);
        assert_eq!(data, 0x00CF_F200_0000_FFFF);
    }

    #[test]
    fn test_segment_base_scatter() {
        // A non-zero base lands in bits 16..40 and 56..64.
        let d = segment_descriptor(0x12B4_5678, 0, 0, 0);
        assert_eq!(d >> 16 & 0xFFFF, 0x5678);
        assert_eq!(d >> 32 & 0xFF, 0xB4);
        assert_eq!(d >> 56 & 0xFF, 0x12);
    }

    #[test]
    fn test_gdt_shape() {
        let gdt = flat_gdt();
        assert_eq!(gdt.len(), 5);
        assert_eq!(gdt[0], 0);
        assert_eq!(KERNEL_CODE_SELECTOR, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR, 0x10);
        assert_eq!(USER_CODE_SELECTOR, 0x1B);
        assert_eq!(USER_DATA_SELECTOR, 0x23);
    }

    #[test]
    fn test_interrupt_gate_encoding() {
        let g = interrupt_gate(0xDEAD_BEEF, KERNEL_CODE_SELECTOR, 0);
        assert_eq!(g & 0xFFFF, 0xBEEF);
        assert_eq!(g >> 16 & 0xFFFF, 0x08);
        // Present, DPL 0, 32-bit interrupt gate.
        assert_eq!(g >> 40 & 0xFF, 0x8E);
        assert_eq!(g >> 48 & 0xFFFF, 0xDEAD);
        // The reserved byte stays clear.
        assert_eq!(g >> 32 & 0xFF, 0);
    }

    #[test]
    fn test_trap_gate_for_syscalls_is_user_reachable() {
        let g = trap_gate(0x0010_2000, KERNEL_CODE_SELECTOR, 3);
        // Present, DPL 3, 32-bit trap gate.
        assert_eq!(g >> 40 & 0xFF, 0xEF);
    }
}
