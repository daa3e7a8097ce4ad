//! Physical memory manager
//!
//! Tracks every 4 KiB frame of the physical address space in two bitmaps:
//! frames the system may hand out at all (*accessible*) and frames
//! currently handed out (*allocated*). Allocation is first-fit by
//! ascending frame index, which keeps behavior deterministic and easy to
//! debug; fragmentation is a non-issue for fixed-size frames.
//!
//! Invariant: `allocated` is a subset of `accessible` for every frame
//! obtained through [`Pmm::alloc`]. Breaking the allocation discipline
//! (double alloc, freeing an unallocated frame, allocating when empty) is
//! a kernel bug and panics.

use spin::Mutex;

use super::bitmap::{frame_address, FrameBitmap, BITMAP_WORDS, WORD_BITS};
use super::{PhysicalAddress, FRAME_SIZE};
use crate::boot::BootInfo;
use crate::error::KernelError;

/// Identity-mapped scratch region reserved directly above the kernel image.
pub const IDENTITY_MAP_BUFFER_SIZE: u32 = 0x0010_0000;

/// Physical memory manager state.
pub struct Pmm {
    /// Frames the system may allocate from at all.
    accessible: FrameBitmap,
    /// Frames currently allocated.
    allocated: FrameBitmap,
}

impl Pmm {
    pub const fn new() -> Self {
        Self {
            accessible: FrameBitmap::new(),
            allocated: FrameBitmap::new(),
        }
    }

    /// Build the frame maps from the boot-info record.
    ///
    /// Every usable region contributes the frames fully contained in it
    /// (start rounded up, length rounded down). The low memory below the
    /// kernel, the kernel image itself, the identity-map buffer above it,
    /// and the framebuffer are then carved back out.
    pub fn init(&mut self, info: &BootInfo) {
        self.accessible.reset();
        self.allocated.reset();

        for region in info.usable_regions() {
            let start = PhysicalAddress::new(region.base).frame_ceil();
            let length = region.length & !(FRAME_SIZE as u32 - 1);
            self.set_accessible_region(start, length);
        }

        // Everything below the kernel stays identity-mapped for legacy BIOS
        // structures and is never handed out.
        self.reserve_region(PhysicalAddress::new(0), info.kernel_image_start);
        self.reserve_region(
            PhysicalAddress::new(info.kernel_image_start),
            info.kernel_image_size,
        );
        self.reserve_region(
            PhysicalAddress::new(info.kernel_image_end()),
            IDENTITY_MAP_BUFFER_SIZE,
        );
        self.reserve_region(
            PhysicalAddress::new(info.framebuffer.address),
            info.framebuffer.size,
        );

        log::info!(
            "pmm: {} accessible frames ({} KiB)",
            self.accessible.set_count(),
            self.accessible.set_count() as u64 * FRAME_SIZE as u64 / 1024
        );
    }

    /// Mark an aligned region accessible. Start and length must be
    /// frame-aligned; a violation is a kernel bug.
    fn set_accessible_region(&mut self, start: PhysicalAddress, length: u32) {
        if !start.is_frame_aligned() {
            panic!("memory region start {start} is not frame aligned");
        }
        if length % FRAME_SIZE as u32 != 0 {
            panic!("memory region length {length:#x} is not frame aligned");
        }
        let first = start.frame_index();
        for frame in first..first + (length / FRAME_SIZE as u32) as usize {
            self.accessible.set(frame);
        }
    }

    /// Mark a region unallocatable. The bounds need not be aligned; the
    /// region is widened to full frames.
    pub fn reserve_region(&mut self, start: PhysicalAddress, size: u32) {
        let first = start.frame_floor().frame_index();
        let last = start.offset(size).frame_ceil().frame_index();
        for frame in first..last {
            self.accessible.clear(frame);
        }
    }

    /// Lowest frame that is accessible and not yet allocated, if any.
    fn first_usable_index(&self) -> Option<usize> {
        for i in 0..BITMAP_WORDS {
            // Word-level skip: all reserved, or all already allocated.
            let usable = self.accessible.word(i) & !self.allocated.word(i);
            if usable != 0 {
                return Some(i * WORD_BITS + usable.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Allocate the lowest free accessible frame.
    ///
    /// Panics when no frame is available; the kernel cannot continue
    /// without physical memory.
    pub fn alloc(&mut self) -> PhysicalAddress {
        match self.try_alloc() {
            Some(addr) => addr,
            None => panic!("out of physical frames"),
        }
    }

    /// Allocate the lowest free accessible frame, or `None` when exhausted.
    ///
    /// Used on paths (fork) that report exhaustion to the caller instead of
    /// treating it as fatal.
    pub fn try_alloc(&mut self) -> Option<PhysicalAddress> {
        let index = self.first_usable_index()?;
        self.allocated.set(index);
        Some(frame_address(index))
    }

    /// Claim a specific frame the caller obtained out of band.
    ///
    /// Accessibility is deliberately not checked: callers use this to claim
    /// known-good frames such as a fresh page-directory frame. Claiming a
    /// frame twice is a kernel bug.
    pub fn alloc_at(&mut self, addr: PhysicalAddress) {
        if self.allocated.test_address(addr) {
            panic!("frame {addr} allocated twice");
        }
        self.allocated.set_address(addr);
    }

    /// Return a frame to the allocator.
    ///
    /// Freeing a frame that is not currently allocated is a kernel bug.
    pub fn free(&mut self, addr: PhysicalAddress) {
        if !self.allocated.test_address(addr) {
            panic!("attempted to free non-allocated frame {addr}");
        }
        self.allocated.clear_address(addr);
    }

    pub fn is_accessible(&self, addr: PhysicalAddress) -> bool {
        self.accessible.test_address(addr)
    }

    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        self.allocated.test_address(addr)
    }

    /// Number of frames currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.allocated.set_count()
    }

    /// Emit both bitmaps as run-length compressed ranges.
    pub fn dump(&self) {
        println!("Physical memory manager state:");
        println!("  System accessible frames (ranges are allocatable):");
        for (start, count) in self.accessible.set_ranges() {
            println!(
                "    {} - {} ({} frames)",
                frame_address(start),
                frame_address(start + count),
                count
            );
        }
        println!("  Frame allocation state (ranges are allocated):");
        for (start, count) in self.allocated.set_ranges() {
            println!(
                "    {} - {} ({} frames)",
                frame_address(start),
                frame_address(start + count),
                count
            );
        }
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

/// Global physical memory manager instance.
pub static PMM: Mutex<Pmm> = Mutex::new(Pmm::new());

/// Initialize the global PMM from the installed boot-info record.
pub fn init() -> Result<(), KernelError> {
    let info = crate::boot::get().ok_or(KernelError::NotInitialized {
        subsystem: "boot info",
    })?;
    PMM.lock().init(info);
    Ok(())
}
