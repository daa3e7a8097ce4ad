//! Boot information bridge
//!
//! Read-only record describing the machine as the bootloader left it:
//! physical memory regions, the kernel image extent, and the framebuffer.
//! The record is populated once during handoff and consumed by the
//! physical memory manager and the paging layer.

use spin::Once;

use crate::error::KernelError;

/// Maximum number of memory regions the record can describe.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Memory region type as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Usable RAM
    Usable,
    /// Reserved by firmware/BIOS
    Reserved,
    /// ACPI data that can be reclaimed
    AcpiReclaimable,
    /// ACPI NVS memory
    AcpiNvs,
    /// Bad memory
    BadMemory,
    /// Unknown type
    Unknown(u32),
}

/// A physical memory region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u32,
    /// Length in bytes.
    pub length: u32,
    /// Firmware-reported type.
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u32, length: u32, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Check whether this region is usable RAM.
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }
}

/// Framebuffer description from the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Physical base address of the framebuffer.
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub bpp: u8,
}

/// The boot-info record.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    region_count: usize,
    /// Physical address where the kernel image begins.
    pub kernel_image_start: u32,
    /// Size of the kernel image in bytes.
    pub kernel_image_size: u32,
    /// Framebuffer extent.
    pub framebuffer: FramebufferInfo,
}

impl BootInfo {
    pub const fn new(
        kernel_image_start: u32,
        kernel_image_size: u32,
        framebuffer: FramebufferInfo,
    ) -> Self {
        const EMPTY: MemoryRegion = MemoryRegion::new(0, 0, RegionKind::Reserved);
        Self {
            regions: [EMPTY; MAX_MEMORY_REGIONS],
            region_count: 0,
            kernel_image_start,
            kernel_image_size,
            framebuffer,
        }
    }

    /// Append a memory region to the record.
    pub fn push_region(&mut self, region: MemoryRegion) -> Result<(), KernelError> {
        if self.region_count == MAX_MEMORY_REGIONS {
            return Err(KernelError::ResourceExhausted {
                resource: "boot memory regions",
            });
        }
        self.regions[self.region_count] = region;
        self.region_count += 1;
        Ok(())
    }

    /// All recorded memory regions.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.region_count]
    }

    /// Usable RAM regions only.
    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions().iter().filter(|r| r.is_usable())
    }

    /// First physical address past the kernel image.
    pub fn kernel_image_end(&self) -> u32 {
        self.kernel_image_start + self.kernel_image_size
    }
}

/// Record installed exactly once during bootloader handoff.
static BOOT_INFO: Once<BootInfo> = Once::new();

/// Install the boot-info record. Later calls are ignored.
pub fn install(info: BootInfo) {
    BOOT_INFO.call_once(|| info);
    log::info!(
        "boot info: {} regions, kernel {:#010x}+{:#x}",
        info.region_count,
        info.kernel_image_start,
        info.kernel_image_size
    );
}

/// The installed boot-info record, if handoff has happened.
pub fn get() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn framebuffer() -> FramebufferInfo {
        FramebufferInfo {
            address: 0xE000_0000,
            size: 1024 * 768 * 4,
            width: 1024,
            height: 768,
            bpp: 32,
        }
    }

    #[test]
    fn test_region_accounting() {
        let mut info = BootInfo::new(0x0010_0000, 0x2_0000, framebuffer());
        info.push_region(MemoryRegion::new(0, 0x9_F000, RegionKind::Usable))
            .expect("first region fits");
        info.push_region(MemoryRegion::new(0x000F_0000, 0x1_0000, RegionKind::Reserved))
            .expect("second region fits");
        info.push_region(MemoryRegion::new(0x0010_0000, 0x0F00_0000, RegionKind::Usable))
            .expect("third region fits");

        assert_eq!(info.regions().len(), 3);
        assert_eq!(info.usable_regions().count(), 2);
        assert_eq!(info.kernel_image_end(), 0x0012_0000);
    }

    #[test]
    fn test_region_table_capacity() {
        let mut info = BootInfo::new(0, 0, framebuffer());
        for i in 0..MAX_MEMORY_REGIONS {
            info.push_region(MemoryRegion::new(i as u32 * 0x1000, 0x1000, RegionKind::Usable))
                .expect("regions up to capacity fit");
        }
        let err = info
            .push_region(MemoryRegion::new(0, 0x1000, RegionKind::Usable))
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::ResourceExhausted {
                resource: "boot memory regions"
            }
        );
    }
}
