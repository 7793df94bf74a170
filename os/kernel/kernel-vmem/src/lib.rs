//! # Virtual Memory Support
//!
//! The seam between the architecture-independent memory-management core and
//! the hardware page tables.
//!
//! ## What you get
//! - [`Permissions`]: the architecture-neutral access rights of a mapping.
//! - [`PageTableAdapter`]: the four operations the core needs from a page
//!   table (`map_page`, `unmap_page`, `remap_page`, `translate`) plus table
//!   teardown. One implementation exists per target architecture; the core
//!   never branches on architecture.
//! - [`FrameSource`]: where an adapter draws frames for intermediate tables.
//! - [`PhysMapper`]: how an adapter touches a physical table frame.
//! - [`X86PageTable`]: the x86-64 four-level implementation.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each. Only
//! 4 KiB leaves are ever installed by [`X86PageTable`].

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod page_entry_bits;
mod page_table;
mod permissions;
mod x86_page_table;

pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, split_indices};
pub use crate::permissions::Permissions;
pub use crate::x86_page_table::X86PageTable;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Failures of a page-table operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame available for an intermediate page table")]
    OutOfTableFrames,
    #[error("virtual address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("virtual address {0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("virtual address {0} is covered by a huge page")]
    HugePage(VirtualAddress),
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
}

/// Source of **physical** 4 KiB frames for intermediate page tables.
///
/// Implementations are internally synchronized, hence `&self`. Returned frames
/// **must** be 4 KiB aligned; their contents are undefined.
pub trait FrameSource {
    /// Allocate one frame, or `None` on exhaustion.
    fn allocate_table_frame(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`allocate_table_frame`](Self::allocate_table_frame).
    fn release_table_frame(&self, frame: PhysicalAddress);
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (e.g., via identity map or a higher-half
/// direct map, HHDM).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped as writable in the current page tables.
    /// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
    ///   for `'a`.
    /// - Type `T` must match the bytes at `pa` (no aliasing UB).
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Page-table operations required by the memory-management core.
///
/// All operations are synchronous and act on one 4 KiB page. Callers serialize
/// access (the owning page manager holds its address-space lock around every
/// call).
pub trait PageTableAdapter {
    /// Install `va → pa` with `permissions`, creating intermediate tables from
    /// `frames` as needed.
    ///
    /// # Errors
    /// [`MapError::AlreadyMapped`] if `va` has a leaf, [`MapError::OutOfTableFrames`]
    /// if an intermediate table could not be allocated.
    fn map_page<F: FrameSource + ?Sized>(
        &mut self,
        frames: &F,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: Permissions,
    ) -> Result<(), MapError>;

    /// Remove the leaf for `va` and return the physical frame it pointed to.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no leaf.
    fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MapError>;

    /// Replace the permissions of the existing leaf for `va`, keeping its frame.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no leaf.
    fn remap_page(&mut self, va: VirtualAddress, permissions: Permissions)
    -> Result<(), MapError>;

    /// Translate `va` to a physical address (including the in-page offset).
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Return every table frame (intermediate tables and the root) to `frames`.
    ///
    /// Leaves must already be unmapped; the frames they pointed to are not
    /// owned by the table.
    fn release_tables<F: FrameSource + ?Sized>(&mut self, frames: &F);
}

/// Align `x` down to the nearest multiple of `a` (`a` must be a power of two).
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` must be a power of two).
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
