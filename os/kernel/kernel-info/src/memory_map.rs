//! # Firmware Memory Map
//!
//! The boot-time description of physical memory. Firmware glue translates its
//! native descriptors (UEFI `EFI_MEMORY_DESCRIPTOR`, multiboot tags, ...) into
//! [`MemoryRegion`]s; the frame allocator only ever sees this form.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// What a physical region may be used for.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MemoryRegionKind {
    /// Free RAM the frame allocator may hand out.
    Usable = 0,
    /// Firmware-reserved or otherwise unavailable.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed, reserved until then.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage. Never reclaimable.
    AcpiNvs = 3,
    /// The loaded kernel image (text, data, bss).
    KernelImage = 4,
    /// Loader data still in use during early boot.
    Bootloader = 5,
    /// Linear framebuffer.
    Framebuffer = 6,
    /// Memory reported as faulty.
    BadMemory = 7,
}

impl MemoryRegionKind {
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One contiguous physical range of a single kind.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            length,
            kind,
        }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.as_u64().saturating_add(self.length)
    }

    /// Whole frames fully inside this region, as `[first, end)` frame numbers.
    ///
    /// Usable RAM must never be rounded outward, or a partially usable frame
    /// could be handed out.
    #[must_use]
    pub const fn inner_frames(&self) -> (u64, u64) {
        let first = self.start.as_u64().div_ceil(PAGE_SIZE);
        let end = self.end() / PAGE_SIZE;
        if end < first { (first, first) } else { (first, end) }
    }

    /// Every frame that touches this region, as `[first, end)` frame numbers.
    ///
    /// Reserved ranges are rounded outward so no byte of them stays available.
    #[must_use]
    pub const fn outer_frames(&self) -> (u64, u64) {
        let first = self.start.as_u64() / PAGE_SIZE;
        let end = self.end().div_ceil(PAGE_SIZE);
        (first, end)
    }
}

/// Anything that can enumerate the firmware memory map.
pub trait MemoryMap {
    fn regions(&self) -> impl Iterator<Item = MemoryRegion> + '_;

    /// Highest exclusive end address over all regions.
    fn highest_address(&self) -> u64 {
        self.regions().map(|r| r.end()).max().unwrap_or(0)
    }

    /// Total bytes of usable RAM.
    fn usable_bytes(&self) -> u64 {
        self.regions()
            .filter(|r| r.kind.is_usable())
            .map(|r| r.length)
            .sum()
    }
}

impl MemoryMap for [MemoryRegion] {
    fn regions(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        self.iter().copied()
    }
}

impl<const N: usize> MemoryMap for [MemoryRegion; N] {
    fn regions(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        self.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_regions_round_inward() {
        let r = MemoryRegion::new(0x1800, 0x3000, MemoryRegionKind::Usable);
        // [0x1800, 0x4800) contains whole frames 2 and 3 only.
        assert_eq!(r.inner_frames(), (2, 4));
        assert_eq!(r.outer_frames(), (1, 5));
    }

    #[test]
    fn tiny_region_has_no_inner_frames() {
        let r = MemoryRegion::new(0x1100, 0x100, MemoryRegionKind::Usable);
        let (first, end) = r.inner_frames();
        assert_eq!(first, end);
    }

    #[test]
    fn map_summaries() {
        let map = [
            MemoryRegion::new(0, 0x1000, MemoryRegionKind::Reserved),
            MemoryRegion::new(0x1000, 0x9000, MemoryRegionKind::Usable),
            MemoryRegion::new(0x10_0000, 0x4000, MemoryRegionKind::KernelImage),
        ];
        assert_eq!(map.highest_address(), 0x10_4000);
        assert_eq!(map.usable_bytes(), 0x9000);
        assert_eq!(map[..].regions().count(), 3);
    }
}
