//! Paging layer
//!
//! Two-level i386 page directory / page table structures and the address
//! spaces built from them. Every directory and page table occupies one
//! PMM-claimed frame: ordinary spaces draw structure frames from the
//! allocatable pool (so exhaustion during fork is reported, not fatal),
//! while the boot path claims the kernel directory's frame out of the
//! reserved identity-map buffer with `alloc_at`. On hardware the
//! structures are written in place through the identity map; hosted test
//! builds keep a shadow image per frame so the tree stays walkable.
//!
//! An [`AddressSpace`] owns its directory and tables. Mapped frames below
//! the kernel extent belong to the globally shared kernel half and are
//! linked, not copied, on clone; frames above it are private to the space.
//! Teardown returns private frames, table frames, and the directory frame
//! to the PMM.

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
use alloc::boxed::Box;

use spin::{Mutex, Once};

use super::pmm::Pmm;
use super::{PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE};
use crate::error::KernelError;

/// Entries per page table and per page directory.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Span of virtual address space covered by one page table (4 MiB).
pub const TABLE_SPAN: u32 = (ENTRIES_PER_TABLE * PAGE_SIZE) as u32;

const ADDRESS_MASK: u32 = 0xFFFF_F000;
const FLAGS_MASK: u32 = 0x0000_0FFF;

/// A page-table entry: frame address plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(frame: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(frame.is_frame_aligned());
        Self((frame.as_u32() & ADDRESS_MASK) | (flags.bits() & FLAGS_MASK))
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDRESS_MASK)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }
}

/// A page-directory entry: page-table frame plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct DirectoryEntry(u32);

impl DirectoryEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(table: PhysicalAddress, flags: PageFlags) -> Self {
        Self((table.as_u32() & ADDRESS_MASK) | (flags.bits() & FLAGS_MASK))
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Frame holding the page table this entry points at.
    pub const fn table(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDRESS_MASK)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }
}

/// Hardware-visible page table: 1024 entries covering 4 MiB.
#[repr(C, align(4096))]
#[derive(Debug)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl Default for PageTable {
    fn default() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRIES_PER_TABLE],
        }
    }
}

/// Hardware-visible page directory: 1024 entries covering 4 GiB.
#[repr(C, align(4096))]
#[derive(Debug)]
pub struct PageDirectory {
    entries: [DirectoryEntry; ENTRIES_PER_TABLE],
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self {
            entries: [DirectoryEntry::empty(); ENTRIES_PER_TABLE],
        }
    }
}

/// One PMM-claimed frame holding a hardware paging structure.
///
/// On hardware the structure is the frame itself, reached through the
/// identity map. Hosted builds treat frame addresses as opaque handles,
/// so a shadow image keeps the structure walkable under test.
#[derive(Debug)]
struct FrameBox<T> {
    frame: PhysicalAddress,
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    image: Box<T>,
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    _structure: core::marker::PhantomData<T>,
}

impl<T: Default> FrameBox<T> {
    /// Wrap a freshly claimed frame as an all-empty structure.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn new(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_frame_aligned());
        // SAFETY: The frame was just claimed from the PMM, is identity
        // mapped, and nothing else aliases it; zeroing marks every entry
        // non-present.
        unsafe { core::ptr::write_bytes(frame.as_usize() as *mut u8, 0, FRAME_SIZE) };
        Self {
            frame,
            _structure: core::marker::PhantomData,
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn new(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_frame_aligned());
        Self {
            frame,
            image: Box::new(T::default()),
        }
    }

    fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn get(&self) -> &T {
        // SAFETY: The frame is exclusively owned by this box, frame
        // aligned, and identity mapped for the kernel.
        unsafe { &*(self.frame.as_usize() as *const T) }
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn get_mut(&mut self) -> &mut T {
        // SAFETY: As in `get`; `&mut self` guarantees uniqueness.
        unsafe { &mut *(self.frame.as_usize() as *mut T) }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn get(&self) -> &T {
        &self.image
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn get_mut(&mut self) -> &mut T {
        &mut self.image
    }
}

/// A translation result: the mapped frame and its permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: PhysicalAddress,
    pub flags: PageFlags,
}

/// An address space: one page directory and the tables hanging off it.
#[derive(Debug)]
pub struct AddressSpace {
    directory: FrameBox<PageDirectory>,
    tables: [Option<FrameBox<PageTable>>; ENTRIES_PER_TABLE],
    /// Virtual addresses below this belong to the shared kernel half.
    kernel_extent: VirtualAddress,
}

impl AddressSpace {
    /// Create an empty address space with a pool-allocated directory
    /// frame. Exhaustion is reported so fork can fail cleanly.
    pub fn new(kernel_extent: VirtualAddress, pmm: &mut Pmm) -> Result<Self, KernelError> {
        let frame = pmm.try_alloc().ok_or(KernelError::OutOfMemory {
            requested: FRAME_SIZE,
        })?;
        Ok(Self::from_directory(kernel_extent, frame))
    }

    /// Create an empty address space over a directory frame the caller
    /// obtained out of band, claiming it with `alloc_at`. The boot path
    /// uses this to place the kernel directory in the reserved
    /// identity-map buffer, which first-fit allocation can never reach.
    pub fn with_directory_at(
        kernel_extent: VirtualAddress,
        frame: PhysicalAddress,
        pmm: &mut Pmm,
    ) -> Self {
        pmm.alloc_at(frame);
        Self::from_directory(kernel_extent, frame)
    }

    fn from_directory(kernel_extent: VirtualAddress, frame: PhysicalAddress) -> Self {
        Self {
            directory: FrameBox::new(frame),
            tables: [const { None }; ENTRIES_PER_TABLE],
            kernel_extent,
        }
    }

    /// Physical address of the directory, as loaded into CR3.
    pub fn directory_addr(&self) -> PhysicalAddress {
        self.directory.frame()
    }

    pub fn kernel_extent(&self) -> VirtualAddress {
        self.kernel_extent
    }

    /// Make sure the table covering directory slot `di` exists, claiming
    /// a pool frame for it if not.
    fn ensure_table(&mut self, di: usize, user: bool, pmm: &mut Pmm) -> Result<(), KernelError> {
        if self.tables[di].is_some() {
            // Directory permissions are the union of the table's needs.
            let entry = self.directory.get().entries[di];
            if user && !entry.flags().contains(PageFlags::USER) {
                self.directory.get_mut().entries[di] =
                    DirectoryEntry::new(entry.table(), entry.flags() | PageFlags::USER);
            }
            return Ok(());
        }

        let frame = pmm.try_alloc().ok_or(KernelError::OutOfMemory {
            requested: FRAME_SIZE,
        })?;
        let mut dir_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if user {
            dir_flags |= PageFlags::USER;
        }
        self.directory.get_mut().entries[di] = DirectoryEntry::new(frame, dir_flags);
        self.tables[di] = Some(FrameBox::new(frame));
        Ok(())
    }

    /// Map `vaddr` to `frame` with the given permissions, claiming a page
    /// table frame if the slot has none yet. Remapping an already-mapped
    /// page overwrites the previous entry; running out of frames for a
    /// new table is reported.
    pub fn map(
        &mut self,
        vaddr: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
        pmm: &mut Pmm,
    ) -> Result<(), KernelError> {
        let di = vaddr.directory_index();
        self.ensure_table(di, flags.contains(PageFlags::USER), pmm)?;
        let table = self.tables[di].as_mut().expect("table exists after ensure");
        table.get_mut().entries[vaddr.table_index()] =
            PageTableEntry::new(frame, flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Remove the mapping for `vaddr` and invalidate its TLB entry.
    /// Unmapping an unmapped page is a no-op.
    pub fn unmap(&mut self, vaddr: VirtualAddress) {
        let di = vaddr.directory_index();
        let Some(table) = self.tables[di].as_mut() else {
            return;
        };
        let ti = vaddr.table_index();
        if !table.get().entries[ti].is_present() {
            return;
        }
        table.get_mut().entries[ti] = PageTableEntry::empty();
        crate::arch::flush_tlb_entry(vaddr.as_u32());
    }

    /// Translate a virtual address to its mapped frame and permissions.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<Mapping> {
        let table = self.tables[vaddr.directory_index()].as_ref()?;
        let entry = table.get().entries[vaddr.table_index()];
        if !entry.is_present() {
            return None;
        }
        Some(Mapping {
            frame: entry.frame(),
            flags: entry.flags(),
        })
    }

    /// Identity-map `[start, start + length)` with the given permissions.
    pub fn identity_map_region(
        &mut self,
        start: PhysicalAddress,
        length: u32,
        flags: PageFlags,
        pmm: &mut Pmm,
    ) -> Result<(), KernelError> {
        let first = start.frame_floor().as_u32();
        let last = start.offset(length).frame_ceil().as_u32();
        let mut addr = first;
        while addr < last {
            self.map(VirtualAddress::new(addr), PhysicalAddress::new(addr), flags, pmm)?;
            addr += FRAME_SIZE as u32;
        }
        Ok(())
    }

    fn is_kernel_address(&self, vaddr: VirtualAddress) -> bool {
        vaddr < self.kernel_extent
    }

    /// Deep-clone this address space.
    ///
    /// The clone gets its own directory and tables, all claimed from the
    /// pool. Entries in the shared kernel half keep their frame (link-only
    /// clone); all other entries get a fresh frame whose contents are
    /// copied. Running out of frames at any step (directory, table, or
    /// data) releases everything the clone had claimed and reports the
    /// exhaustion, so the forking parent continues.
    pub fn clone_directory(&self, pmm: &mut Pmm) -> Result<AddressSpace, KernelError> {
        let mut clone = AddressSpace::new(self.kernel_extent, pmm)?;

        for di in 0..ENTRIES_PER_TABLE {
            let Some(table) = self.tables[di].as_ref() else {
                continue;
            };
            for ti in 0..ENTRIES_PER_TABLE {
                let entry = table.get().entries[ti];
                if !entry.is_present() {
                    continue;
                }
                let vaddr = VirtualAddress::new((di as u32) << 22 | (ti as u32) << 12);
                if self.is_kernel_address(vaddr) {
                    // Shared kernel half: reference the same frame.
                    if let Err(err) = clone.map(vaddr, entry.frame(), entry.flags(), pmm) {
                        clone.release(pmm);
                        return Err(err);
                    }
                } else {
                    let Some(frame) = pmm.try_alloc() else {
                        clone.release(pmm);
                        return Err(KernelError::OutOfMemory {
                            requested: FRAME_SIZE,
                        });
                    };
                    copy_frame_contents(entry.frame(), frame);
                    if let Err(err) = clone.map(vaddr, frame, entry.flags(), pmm) {
                        // The data frame is not mapped yet, so the release
                        // below would miss it.
                        pmm.free(frame);
                        clone.release(pmm);
                        return Err(err);
                    }
                }
            }
        }

        Ok(clone)
    }

    /// Return every private (non-kernel-half) data frame to the PMM and
    /// clear the mappings. Table and directory frames stay; [`Self::release`]
    /// is the full teardown.
    pub fn release_frames(&mut self, pmm: &mut Pmm) {
        let extent = self.kernel_extent;
        for di in 0..ENTRIES_PER_TABLE {
            let Some(table) = self.tables[di].as_mut() else {
                continue;
            };
            for ti in 0..ENTRIES_PER_TABLE {
                let entry = table.get().entries[ti];
                if !entry.is_present() {
                    continue;
                }
                let vaddr = VirtualAddress::new((di as u32) << 22 | (ti as u32) << 12);
                if vaddr >= extent {
                    pmm.free(entry.frame());
                    table.get_mut().entries[ti] = PageTableEntry::empty();
                }
            }
        }
    }

    /// Tear the space down: private data frames, every page-table frame,
    /// and the directory frame all go back to the PMM. Called when the
    /// owning task is reaped and when a partial clone is rolled back.
    pub fn release(mut self, pmm: &mut Pmm) {
        self.release_frames(pmm);
        for slot in self.tables.iter_mut() {
            if let Some(table) = slot.take() {
                pmm.free(table.frame());
            }
        }
        pmm.free(self.directory.frame());
    }

    /// Number of present mappings (diagnostics, accounting).
    pub fn mapped_page_count(&self) -> usize {
        self.tables
            .iter()
            .flatten()
            .map(|t| t.get().entries.iter().filter(|e| e.is_present()).count())
            .sum()
    }
}

/// Copy the 4 KiB contents of `src` into `dst` through the identity map.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn copy_frame_contents(src: PhysicalAddress, dst: PhysicalAddress) {
    // SAFETY: Both frames come from the PMM and are identity mapped for the
    // kernel; they are 4 KiB, frame-aligned, and disjoint (dst was just
    // allocated while src was already in use).
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.as_usize() as *const u8,
            dst.as_usize() as *mut u8,
            FRAME_SIZE,
        );
    }
}

/// Hosted builds treat frames as opaque handles; there is nothing to copy.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn copy_frame_contents(_src: PhysicalAddress, _dst: PhysicalAddress) {}

/// Build the kernel address space: identity-map everything from the start
/// of physical memory through the kernel image and its identity-map
/// buffer, plus the framebuffer, all present and writable.
///
/// The kernel directory occupies the first frame of the identity-map
/// buffer, claimed with `alloc_at` (the buffer is reserved, so first-fit
/// allocation can never hand it out); the kernel's page tables draw from
/// the pool like any other space.
pub fn init_kernel_space(
    info: &crate::boot::BootInfo,
    pmm: &mut Pmm,
) -> Result<AddressSpace, KernelError> {
    let identity_end = info.kernel_image_end() + super::pmm::IDENTITY_MAP_BUFFER_SIZE;
    let mut space = AddressSpace::with_directory_at(
        VirtualAddress::new(identity_end),
        PhysicalAddress::new(info.kernel_image_end()),
        pmm,
    );
    space.identity_map_region(
        PhysicalAddress::new(0),
        identity_end,
        PageFlags::PRESENT | PageFlags::WRITABLE,
        pmm,
    )?;
    space.identity_map_region(
        PhysicalAddress::new(info.framebuffer.address),
        info.framebuffer.size,
        PageFlags::PRESENT | PageFlags::WRITABLE,
        pmm,
    )?;
    log::info!(
        "paging: kernel space identity-mapped up to {:#010x}, directory at {}",
        identity_end,
        space.directory_addr()
    );
    Ok(space)
}

/// Load the kernel directory and turn paging on.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn enable(space: &AddressSpace) {
    crate::arch::x86::enable_paging(space.directory_addr().as_u32());
}

/// The kernel's own address space, installed by [`init`].
pub static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// Build the kernel address space from the boot-info record, install the
/// page-fault handler, and (on hardware) turn paging on.
pub fn init() -> Result<(), KernelError> {
    let info = crate::boot::get().ok_or(KernelError::NotInitialized {
        subsystem: "boot info",
    })?;
    let space = {
        let mut pmm = super::pmm::PMM.lock();
        init_kernel_space(info, &mut pmm)?
    };
    super::page_fault::install();
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    enable(&space);
    KERNEL_SPACE.call_once(|| Mutex::new(space));
    Ok(())
}
