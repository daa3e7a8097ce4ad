//! Page fault handling
//!
//! The architecture trap stub decodes CR2 and the hardware error code into
//! a [`FaultInfo`] and delegates here. A not-present write inside the
//! kernel heap window is serviced by allocating and mapping a fresh frame
//! (the heap grows on demand); everything else is an invariant violation
//! and escalates to a panic naming the faulting address and task.

use super::paging::AddressSpace;
use super::pmm::Pmm;
use super::{PageFlags, PhysicalAddress, VirtualAddress};

/// Base of the kernel heap expansion window.
pub const KHEAP_START: u32 = 0xC000_0000;

/// Size of the kernel heap expansion window (4 MiB).
pub const KHEAP_SIZE: u32 = 0x0040_0000;

/// Decoded page-fault state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// The virtual address that caused the fault (CR2).
    pub addr: VirtualAddress,
    /// Entry was present (protection violation) vs not present.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The fault occurred in user mode.
    pub user: bool,
}

impl FaultInfo {
    /// Decode the i386 page-fault error code pushed by the CPU.
    pub fn from_error_code(addr: VirtualAddress, error_code: u32) -> Self {
        Self {
            addr,
            present: error_code & 1 != 0,
            write: error_code & 2 != 0,
            user: error_code & 4 != 0,
        }
    }
}

/// Outcome of a page-fault resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The heap window grew by one frame; the faulting access can retry.
    HeapFrameMapped(PhysicalAddress),
    /// Unservicable; the caller must escalate.
    Fatal,
}

/// Check whether an address falls inside the heap expansion window.
pub fn in_heap_window(addr: VirtualAddress) -> bool {
    addr.as_u32() >= KHEAP_START && addr.as_u32() < KHEAP_START + KHEAP_SIZE
}

/// Attempt to service a fault by demand-mapping a kernel heap frame.
pub fn resolve(space: &mut AddressSpace, pmm: &mut Pmm, info: FaultInfo) -> FaultResolution {
    if in_heap_window(info.addr) && !info.present && info.write {
        let frame = pmm.alloc();
        let mapped = space.map(
            info.addr.page_floor(),
            frame,
            PageFlags::PRESENT | PageFlags::WRITABLE,
            pmm,
        );
        if mapped.is_err() {
            // No frame left for a page table either; the window cannot
            // grow and the fault escalates.
            pmm.free(frame);
            return FaultResolution::Fatal;
        }
        log::debug!("heap window grew: {} -> {}", info.addr.page_floor(), frame);
        return FaultResolution::HeapFrameMapped(frame);
    }
    FaultResolution::Fatal
}

/// Format-free description of the failed access, for the panic message.
pub fn access_description(info: &FaultInfo) -> &'static str {
    match (info.present, info.write) {
        (false, false) => "read of unmapped page",
        (false, true) => "write to unmapped page",
        (true, false) => "protection violation on read",
        (true, true) => "protection violation on write",
    }
}

/// Hook the page-fault vector to the heap-grow handler.
pub fn install() {
    crate::interrupts::register_handler(crate::interrupts::VECTOR_PAGE_FAULT, handler);
}

/// Trap entry for vector 14. Heap-window faults are serviced in place;
/// anything else brings the kernel down with the full story: the address,
/// the kind of access, and who was running.
fn handler(frame: &mut crate::interrupts::InterruptFrame) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    let addr = VirtualAddress::new(crate::arch::x86::fault_address());
    // Hosted test builds have no CR2; the frame is synthetic anyway.
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let addr = VirtualAddress::new(0);

    let info = FaultInfo::from_error_code(addr, frame.error_code);

    let resolution = match super::paging::KERNEL_SPACE.get() {
        // The page-table allocation draws from the bootstrap arena, and a
        // heap-window fault only ever originates in task context.
        Some(space) => resolve(
            &mut space.lock(),
            &mut super::pmm::PMM.lock(),
            info,
        ),
        None => FaultResolution::Fatal,
    };

    if resolution == FaultResolution::Fatal {
        match crate::task::panic_context() {
            Some((pid, name)) => {
                let name = core::str::from_utf8(&name).unwrap_or("?");
                panic!(
                    "page fault: {} at {} (eip {:#010x}, pid {pid}, task {})",
                    access_description(&info),
                    info.addr,
                    frame.eip,
                    name.trim_end_matches('\0'),
                );
            }
            None => panic!(
                "page fault: {} at {} (eip {:#010x}, before tasking)",
                access_description(&info),
                info.addr,
                frame.eip,
            ),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::boot::{BootInfo, FramebufferInfo, MemoryRegion, RegionKind};
    extern crate alloc;
    use alloc::boxed::Box;

    fn fixtures() -> (Box<Pmm>, AddressSpace) {
        let fb = FramebufferInfo {
            address: 0xE000_0000,
            size: 0x0010_0000,
            width: 640,
            height: 480,
            bpp: 32,
        };
        let mut info = BootInfo::new(0x0010_0000, 0x0002_0000, fb);
        info.push_region(MemoryRegion::new(0x0010_0000, 0x0100_0000, RegionKind::Usable))
            .unwrap();
        let mut pmm = Box::new(Pmm::new());
        pmm.init(&info);
        let space =
            AddressSpace::new(VirtualAddress::new(0x0022_0000), &mut pmm).expect("pool has frames");
        (pmm, space)
    }

    #[test]
    fn test_error_code_decoding() {
        let addr = VirtualAddress::new(0xC000_0123);
        let info = FaultInfo::from_error_code(addr, 0b010);
        assert!(!info.present);
        assert!(info.write);
        assert!(!info.user);
        let info = FaultInfo::from_error_code(addr, 0b101);
        assert!(info.present);
        assert!(!info.write);
        assert!(info.user);
    }

    #[test]
    fn test_heap_window_bounds() {
        assert!(in_heap_window(VirtualAddress::new(KHEAP_START)));
        assert!(in_heap_window(VirtualAddress::new(KHEAP_START + KHEAP_SIZE - 1)));
        assert!(!in_heap_window(VirtualAddress::new(KHEAP_START + KHEAP_SIZE)));
        assert!(!in_heap_window(VirtualAddress::new(KHEAP_START - 1)));
    }

    #[test]
    fn test_heap_write_fault_maps_writable_frame() {
        let (mut pmm, mut space) = fixtures();
        let fault_addr = VirtualAddress::new(KHEAP_START + 0x2345);
        let info = FaultInfo::from_error_code(fault_addr, 0b010);

        let outcome = resolve(&mut space, &mut pmm, info);
        let FaultResolution::HeapFrameMapped(frame) = outcome else {
            panic!("heap fault must be serviced, got {outcome:?}");
        };
        assert!(pmm.is_allocated(frame));

        // The faulting page is now mapped writable; the access can retry.
        let mapping = space.translate(fault_addr.page_floor()).unwrap();
        assert_eq!(mapping.frame, frame);
        assert!(mapping.flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE));
    }

    #[test]
    fn test_fault_outside_window_is_fatal() {
        let (mut pmm, mut space) = fixtures();
        let info = FaultInfo::from_error_code(VirtualAddress::new(0xA000_0000), 0b010);
        assert_eq!(resolve(&mut space, &mut pmm, info), FaultResolution::Fatal);
    }

    #[test]
    fn test_read_fault_in_window_is_fatal() {
        // Only not-present writes grow the heap.
        let (mut pmm, mut space) = fixtures();
        let info = FaultInfo::from_error_code(VirtualAddress::new(KHEAP_START), 0b000);
        assert_eq!(resolve(&mut space, &mut pmm, info), FaultResolution::Fatal);
    }

    #[test]
    fn test_protection_violation_in_window_is_fatal() {
        let (mut pmm, mut space) = fixtures();
        let info = FaultInfo::from_error_code(VirtualAddress::new(KHEAP_START), 0b011);
        assert_eq!(resolve(&mut space, &mut pmm, info), FaultResolution::Fatal);
    }

    #[test]
    fn test_access_descriptions() {
        let addr = VirtualAddress::new(0);
        assert_eq!(
            access_description(&FaultInfo::from_error_code(addr, 0b000)),
            "read of unmapped page"
        );
        assert_eq!(
            access_description(&FaultInfo::from_error_code(addr, 0b011)),
            "protection violation on write"
        );
    }
}
