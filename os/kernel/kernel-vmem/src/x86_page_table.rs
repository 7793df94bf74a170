//! # x86-64 Page Table (PML4-rooted)
//!
//! [`PageTableAdapter`] for x86-64 four-level paging.
//!
//! ## Design
//!
//! - Only 4 KiB leaves are installed. Entries with `PS=1` found during a walk
//!   were placed by someone else (boot identity map) and are reported as
//!   [`MapError::HugePage`] rather than split.
//! - Intermediate tables come from a [`FrameSource`] and are zeroed through the
//!   [`PhysMapper`] before being linked.
//! - Mutating active mappings requires TLB maintenance; when running
//!   bare-metal, `invlpg` is issued after every unmap and remap.

use crate::page_table::{ENTRIES, PageTable, split_indices};
use crate::{FrameSource, MapError, PageEntryBits, PageTableAdapter, Permissions, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::trace;

/// Depth of the walk: PML4 → PDPT → PD → PT.
const LEVELS: usize = 4;

/// Handle to a single x86-64 address space's page tables.
pub struct X86PageTable<'m, M: PhysMapper> {
    /// PML4 frame; `None` once [`release_tables`](PageTableAdapter::release_tables) ran.
    root: Option<PhysicalAddress>,
    mapper: &'m M,
    /// Intermediate tables are created user-accessible.
    user: bool,
}

impl<'m, M: PhysMapper> X86PageTable<'m, M> {
    /// Allocate and zero a fresh PML4.
    ///
    /// # Errors
    /// [`MapError::OutOfTableFrames`] if `frames` is exhausted.
    pub fn new<F: FrameSource + ?Sized>(
        mapper: &'m M,
        frames: &F,
        user: bool,
    ) -> Result<Self, MapError> {
        let root = frames
            .allocate_table_frame()
            .ok_or(MapError::OutOfTableFrames)?;
        let table = Self {
            root: Some(root),
            mapper,
            user,
        };
        table.table_mut(root).zero();
        Ok(table)
    }

    /// Wrap an existing PML4 (e.g. the one the loader built).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress, user: bool) -> Self {
        Self {
            root: Some(root),
            mapper,
            user,
        }
    }

    /// Physical address of the PML4, for loading into CR3.
    #[inline]
    pub const fn root(&self) -> Option<PhysicalAddress> {
        self.root
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The target space must map the currently executing code and stack.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn activate(&self) {
        if let Some(root) = self.root {
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
            }
        }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: every frame we walk is a page table we allocated or were
        // handed as root; the mapper keeps it addressable.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    /// Walk to the PT holding the leaf for `va` without creating anything.
    fn leaf_table(&self, va: VirtualAddress) -> Result<Option<&mut PageTable>, MapError> {
        let Some(mut table_pa) = self.root else {
            return Ok(None);
        };
        let indices = split_indices(va);
        for &index in &indices[..LEVELS - 1] {
            let e = self.table_mut(table_pa).get(index);
            if !e.present() {
                return Ok(None);
            }
            if e.large_page() {
                return Err(MapError::HugePage(va));
            }
            table_pa = e.physical_address();
        }
        Ok(Some(self.table_mut(table_pa)))
    }

    /// Walk to the PT holding the leaf for `va`, creating missing tables.
    fn ensure_leaf_table<F: FrameSource + ?Sized>(
        &self,
        frames: &F,
        va: VirtualAddress,
    ) -> Result<&mut PageTable, MapError> {
        let mut table_pa = self.root.ok_or(MapError::OutOfTableFrames)?;
        let indices = split_indices(va);
        for &index in &indices[..LEVELS - 1] {
            let table = self.table_mut(table_pa);
            let e = table.get(index);
            table_pa = if e.present() {
                if e.large_page() {
                    return Err(MapError::HugePage(va));
                }
                e.physical_address()
            } else {
                let next = frames
                    .allocate_table_frame()
                    .ok_or(MapError::OutOfTableFrames)?;
                self.table_mut(next).zero();
                table.set(index, PageEntryBits::table(next, self.user));
                trace!("page table: new table {next} at index {index} for {va}");
                next
            };
        }
        Ok(self.table_mut(table_pa))
    }

    /// Free the subtree rooted at `table_pa` at `level` (0 = PML4).
    fn release_subtree<F: FrameSource + ?Sized>(&self, frames: &F, table_pa: PhysicalAddress, level: usize) {
        if level < LEVELS - 1 {
            for i in 0..ENTRIES {
                let e = self.table_mut(table_pa).get(i);
                if e.present() && !e.large_page() {
                    self.release_subtree(frames, e.physical_address(), level + 1);
                }
            }
        }
        frames.release_table_frame(table_pa);
    }
}

impl<M: PhysMapper> PageTableAdapter for X86PageTable<'_, M> {
    fn map_page<F: FrameSource + ?Sized>(
        &mut self,
        frames: &F,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: Permissions,
    ) -> Result<(), MapError> {
        if !va.is_aligned() {
            return Err(MapError::Unaligned(va.as_u64()));
        }
        if pa.page_offset() != 0 {
            return Err(MapError::Unaligned(pa.as_u64()));
        }
        let pt = self.ensure_leaf_table(frames, va)?;
        let index = split_indices(va)[LEVELS - 1];
        if pt.get(index).present() {
            return Err(MapError::AlreadyMapped(va));
        }
        pt.set(index, PageEntryBits::leaf(pa, permissions));
        Ok(())
    }

    fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        let pt = self.leaf_table(va)?.ok_or(MapError::NotMapped(va))?;
        let index = split_indices(va)[LEVELS - 1];
        let e = pt.get(index);
        if !e.present() {
            return Err(MapError::NotMapped(va));
        }
        pt.set(index, PageEntryBits::new());
        invalidate_tlb_page(va);
        Ok(e.physical_address())
    }

    fn remap_page(&mut self, va: VirtualAddress, permissions: Permissions) -> Result<(), MapError> {
        let pt = self.leaf_table(va)?.ok_or(MapError::NotMapped(va))?;
        let index = split_indices(va)[LEVELS - 1];
        let e = pt.get(index);
        if !e.present() {
            return Err(MapError::NotMapped(va));
        }
        pt.set(index, e.with_permissions(permissions));
        invalidate_tlb_page(va);
        Ok(())
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pt = self.leaf_table(va).ok().flatten()?;
        let e = pt.get(split_indices(va)[LEVELS - 1]);
        if !e.present() {
            return None;
        }
        Some(e.physical_address() + va.page_offset())
    }

    fn release_tables<F: FrameSource + ?Sized>(&mut self, frames: &F) {
        if let Some(root) = self.root.take() {
            self.release_subtree(frames, root, 0);
        }
    }
}

/// Invalidate one VA on this CPU.
#[inline]
#[allow(unused_variables)]
fn invalidate_tlb_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}
