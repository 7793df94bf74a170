//! # HHDM-based PhysMapper
//!
//! [`PhysMapper`] for kernels that map all physical memory at a fixed offset
//! (higher-half direct map). [`X86PageTable`](kernel_vmem::X86PageTable) uses
//! it to reach table frames handed out by the
//! [`PhysicalFrameAllocator`](crate::PhysicalFrameAllocator).
//!
//! With an HHDM every physical address `pa` is visible at `offset + pa`. The
//! kernel uses [`HHDM_BASE`]; any other offset works the same way as long as
//! the whole managed range is mapped there.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over a direct map at a fixed offset.
///
/// # Safety
/// The direct mapping must be present, writable and cover the referenced
/// physical range whenever [`phys_to_mut`](PhysMapper::phys_to_mut) is used.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// The kernel's direct map at [`HHDM_BASE`].
    pub const KERNEL: Self = Self::new(HHDM_BASE);

    /// Direct map whose physical address 0 is visible at `offset`.
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Where `pa` is visible in the direct map.
    #[inline]
    #[must_use]
    pub const fn virtual_address(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset + pa.as_u64())
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::KERNEL
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.virtual_address(pa).as_u64() as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and mapped via the direct map.
        unsafe { &mut *va }
    }
}
