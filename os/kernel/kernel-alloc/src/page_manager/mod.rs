//! # Page Manager
//!
//! Per-address-space façade coupling virtual-range decisions
//! ([`AddressSpaceAllocator`]) to frame commitment ([`PhysicalFrameAllocator`])
//! and page-table mapping ([`PageTableAdapter`]).
//!
//! ## Allocation objects
//!
//! Every claimed range is an [`AllocationObject`] in one of two states:
//!
//! ```text
//!   reserve_pages ──► Standby ──(allocate_pages_at inside it)──► InUse ◄── allocate_pages
//!                        │                                          │
//!                        └──────────────── free_pages ──────────────┘
//! ```
//!
//! Allocating at an address inside a Standby object with the same permissions
//! splits the object and promotes only the requested slice. Nothing is ever
//! committed on a page fault; all commitment is explicit.
//!
//! ## Failure policy
//!
//! Exhaustion of virtual space or frames is returned to the caller after the
//! partial work has been rolled back: mapped pages are unmapped, their frames
//! freed and the virtual claim returned to the free index. In a
//! [`Kernel`](AddressSpaceKind::Kernel) address space the same exhaustion is
//! fatal instead.
//!
//! ## Locking
//!
//! One [`SpinLock`] per address space spans every public call, which makes
//! the multi-step index updates of the underlying allocator atomic. The frame
//! bitmap has its own lock and is shared by all address spaces.

mod config;
mod object;

pub use config::{AddressSpaceConfig, AddressSpaceKind};
pub use object::{AllocationObject, ObjectState};

use crate::vspace::AddressSpaceAllocator;
use crate::{MemoryError, PhysicalFrameAllocator};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, checked_pages_to_bytes};
use kernel_sync::SpinLock;
use kernel_vmem::{PageTableAdapter, Permissions};
use log::{debug, info, trace, warn};
use object::{ObjectArena, ObjectHandle};

/// Page and frame accounting of one address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressSpaceUsage {
    pub kind: AddressSpaceKind,
    pub total_pages: u64,
    pub free_pages: u64,
    /// Pages held by Standby objects.
    pub reserved_pages: u64,
    /// Pages held by InUse objects.
    pub used_pages: u64,
    /// Frames backing InUse objects (page-table frames excluded).
    pub committed_frames: u64,
    pub objects: usize,
}

/// One address space: its virtual window, its objects and its page table.
pub struct PageManager<'f, P: PageTableAdapter> {
    kind: AddressSpaceKind,
    frames: &'f PhysicalFrameAllocator,
    inner: SpinLock<Inner<P>>,
}

struct Inner<P> {
    vspace: AddressSpaceAllocator,
    objects: ObjectArena,
    by_address: BTreeMap<u64, ObjectHandle>,
    page_table: P,
    committed: u64,
}

impl<'f, P: PageTableAdapter> PageManager<'f, P> {
    /// Create an address space over `config`'s window, mapping through
    /// `page_table` and committing frames from `frames`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if the window is malformed.
    pub fn create_address_space(
        frames: &'f PhysicalFrameAllocator,
        config: AddressSpaceConfig,
        page_table: P,
    ) -> Result<Self, MemoryError> {
        let vspace = AddressSpaceAllocator::new(config.base, config.pages, config.max_pages)?;
        info!(
            "page manager: created {:?} address space at {} ({} pages)",
            config.kind, config.base, config.pages
        );
        Ok(Self {
            kind: config.kind,
            frames,
            inner: SpinLock::new(Inner {
                vspace,
                objects: ObjectArena::default(),
                by_address: BTreeMap::new(),
                page_table,
                committed: 0,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    /// Claim, commit and map `count` pages anywhere in the window.
    ///
    /// # Errors
    /// [`MemoryError::OutOfVirtualSpace`] / [`MemoryError::OutOfPhysicalMemory`]
    /// on exhaustion (fatal in a kernel address space),
    /// [`MemoryError::InvalidRange`] for `count == 0`.
    pub fn allocate_pages(
        &self,
        count: u64,
        permissions: Permissions,
    ) -> Result<VirtualAddress, MemoryError> {
        let permissions = self.effective(permissions);
        let result = self.inner.with_lock(|inner| {
            let base = inner.vspace.allocate(count)?;
            if let Err(e) = inner.commit(self.frames, base, count, permissions) {
                inner.return_claim(base, count);
                return Err(e);
            }
            inner.insert(AllocationObject {
                base,
                pages: count,
                permissions,
                state: ObjectState::InUse,
            });
            Ok(base)
        });
        self.escalate(result, "allocate", count)
    }

    /// Single-page [`allocate_pages`](Self::allocate_pages).
    ///
    /// # Errors
    /// As [`allocate_pages`](Self::allocate_pages).
    #[inline]
    pub fn allocate_page(&self, permissions: Permissions) -> Result<VirtualAddress, MemoryError> {
        self.allocate_pages(1, permissions)
    }

    /// Commit and map exactly `[address, address + count)`.
    ///
    /// If the range lies inside a Standby object with the same permissions,
    /// that object is split and only the requested slice is promoted to
    /// InUse. Otherwise the range must be entirely free.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] for `count == 0`, or if the range is
    /// misaligned, leaves the window, overlaps a live object incompatibly or
    /// straddles a Standby object's end; exhaustion as for
    /// [`allocate_pages`](Self::allocate_pages). A failed promotion leaves
    /// the Standby object untouched.
    pub fn allocate_pages_at(
        &self,
        address: VirtualAddress,
        count: u64,
        permissions: Permissions,
    ) -> Result<(), MemoryError> {
        let permissions = self.effective(permissions);
        let result = self.inner.with_lock(|inner| {
            if count == 0 {
                return Err(MemoryError::InvalidRange);
            }
            let end = checked_end(address, count).ok_or(MemoryError::InvalidRange)?;
            if let Some((handle, object)) = inner.object_containing(address.as_u64()) {
                let promotable = object.state == ObjectState::Standby
                    && object.permissions == permissions
                    && address.is_aligned()
                    && end <= object.end();
                if !promotable {
                    return Err(MemoryError::InvalidRange);
                }
                return inner.promote(self.frames, handle, address, count);
            }

            inner.vspace.allocate_at(address, count)?;
            if let Err(e) = inner.commit(self.frames, address, count, permissions) {
                inner.return_claim(address, count);
                return Err(e);
            }
            inner.insert(AllocationObject {
                base: address,
                pages: count,
                permissions,
                state: ObjectState::InUse,
            });
            Ok(())
        });
        self.escalate(result, "allocate", count)
    }

    /// Claim `count` pages anywhere in the window without committing them.
    ///
    /// # Errors
    /// As [`allocate_pages`](Self::allocate_pages), minus frame exhaustion.
    pub fn reserve_pages(
        &self,
        count: u64,
        permissions: Permissions,
    ) -> Result<VirtualAddress, MemoryError> {
        let permissions = self.effective(permissions);
        let result = self.inner.with_lock(|inner| {
            let base = inner.vspace.reserve_any(count)?;
            inner.insert(AllocationObject {
                base,
                pages: count,
                permissions,
                state: ObjectState::Standby,
            });
            Ok(base)
        });
        self.escalate(result, "reserve", count)
    }

    /// Claim exactly `[address, address + count)` without committing it.
    ///
    /// # Errors
    /// [`MemoryError::DoubleReservation`] if any page is already claimed,
    /// [`MemoryError::InvalidRange`] if misaligned or outside the window.
    pub fn reserve_pages_at(
        &self,
        address: VirtualAddress,
        count: u64,
        permissions: Permissions,
    ) -> Result<(), MemoryError> {
        let permissions = self.effective(permissions);
        let result = self.inner.with_lock(|inner| {
            inner.vspace.reserve(address, count)?;
            inner.insert(AllocationObject {
                base: address,
                pages: count,
                permissions,
                state: ObjectState::Standby,
            });
            Ok(())
        });
        self.escalate(result, "reserve", count)
    }

    /// Destroy the object starting at `address`: unmap it, release its
    /// frames and return its range to the free index.
    ///
    /// Freeing an address that starts no object is logged and ignored
    /// (reported as [`MemoryError::InvalidRange`] with `strict-free`).
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if `address` lies inside an object but
    /// is not its base.
    pub fn free_pages(&self, address: VirtualAddress) -> Result<(), MemoryError> {
        self.inner.with_lock(|inner| {
            let start = address.as_u64();
            let Some(&handle) = inner.by_address.get(&start) else {
                if inner.object_containing(start).is_some() {
                    return Err(MemoryError::InvalidRange);
                }
                if cfg!(feature = "strict-free") {
                    warn!("page manager: rejected free of unknown address {address}");
                    return Err(MemoryError::InvalidRange);
                }
                warn!("page manager: ignoring free of unknown address {address}");
                return Ok(());
            };
            inner.release(self.frames, handle)
        })
    }

    /// Apply `permissions` to every page of the object starting at `address`.
    /// Backing frames are untouched.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] unless `address` is an object's base.
    pub fn remap(&self, address: VirtualAddress, permissions: Permissions) -> Result<(), MemoryError> {
        let permissions = self.effective(permissions);
        self.inner.with_lock(|inner| {
            let handle = *inner
                .by_address
                .get(&address.as_u64())
                .ok_or(MemoryError::InvalidRange)?;
            let object = *inner.objects.get(handle).ok_or(MemoryError::InvalidRange)?;

            if object.state == ObjectState::InUse {
                for i in 0..object.pages {
                    let va = object.base + i * PAGE_SIZE;
                    if let Err(e) = inner.page_table.remap_page(va, permissions) {
                        // Put back what was already changed.
                        for j in 0..i {
                            let done = object.base + j * PAGE_SIZE;
                            if let Err(undo) = inner.page_table.remap_page(done, object.permissions) {
                                warn!("page manager: could not restore permissions of {done}: {undo}");
                            }
                        }
                        return Err(e.into());
                    }
                }
            }
            if let Some(o) = inner.objects.get_mut(handle) {
                o.permissions = permissions;
            }
            trace!("page manager: remapped {address} ({} pages)", object.pages);
            Ok(())
        })
    }

    /// Whether every byte of `[address, address + size)` is backed by InUse
    /// objects granting read access. Any gap fails the whole query.
    #[must_use]
    pub fn is_readable(&self, address: VirtualAddress, size: u64) -> bool {
        self.is_covered(address, size, Permissions::READ_ONLY)
    }

    /// Like [`is_readable`](Self::is_readable), requiring write access.
    #[must_use]
    pub fn is_writable(&self, address: VirtualAddress, size: u64) -> bool {
        self.is_covered(address, size, Permissions::NONE.with_write(true))
    }

    /// [`is_readable`](Self::is_readable) as a `Result`.
    ///
    /// # Errors
    /// [`MemoryError::PermissionDenied`] if the span is not fully readable.
    pub fn check_readable(&self, address: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        if self.is_readable(address, size) {
            Ok(())
        } else {
            Err(MemoryError::PermissionDenied)
        }
    }

    /// [`is_writable`](Self::is_writable) as a `Result`.
    ///
    /// # Errors
    /// [`MemoryError::PermissionDenied`] if the span is not fully writable.
    pub fn check_writable(&self, address: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        if self.is_writable(address, size) {
            Ok(())
        } else {
            Err(MemoryError::PermissionDenied)
        }
    }

    /// Permissions of the object containing `address`, in either state.
    #[must_use]
    pub fn get_permissions(&self, address: VirtualAddress) -> Option<Permissions> {
        self.inner.with_lock(|inner| {
            inner
                .object_containing(address.as_u64())
                .map(|(_, o)| o.permissions)
        })
    }

    /// Grow the window to `new_pages` pages.
    ///
    /// # Errors
    /// [`MemoryError::OutOfVirtualSpace`] past the configured maximum,
    /// [`MemoryError::InvalidRange`] if it would shrink the window.
    pub fn expand_virtual_region_to_right(&self, new_pages: u64) -> Result<(), MemoryError> {
        self.inner
            .with_lock(|inner| inner.vspace.expand_right(new_pages))
    }

    /// Merge adjacent free runs of the window.
    pub fn compact_free_ranges(&self) -> usize {
        self.inner.with_lock(|inner| inner.vspace.compact_free_ranges())
    }

    #[must_use]
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        self.inner.with_lock(|inner| inner.page_table.translate(address))
    }

    #[must_use]
    pub fn usage(&self) -> AddressSpaceUsage {
        self.inner.with_lock(|inner| {
            let stats = inner.vspace.stats();
            AddressSpaceUsage {
                kind: self.kind,
                total_pages: stats.total,
                free_pages: stats.free,
                reserved_pages: stats.reserved,
                used_pages: stats.used,
                committed_frames: inner.committed,
                objects: inner.objects.len(),
            }
        })
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.with_lock(|inner| inner.objects.len())
    }

    /// The object containing `address`.
    #[must_use]
    pub fn object_at(&self, address: VirtualAddress) -> Option<AllocationObject> {
        self.inner
            .with_lock(|inner| inner.object_containing(address.as_u64()).map(|(_, o)| o))
    }

    /// All objects in address order.
    #[must_use]
    pub fn objects(&self) -> Vec<AllocationObject> {
        self.inner.with_lock(|inner| {
            inner
                .by_address
                .values()
                .filter_map(|&h| inner.objects.get(h).copied())
                .collect()
        })
    }

    /// Address-ordered free runs of the window.
    #[must_use]
    pub fn free_runs(&self) -> Vec<(VirtualAddress, u64)> {
        self.inner.with_lock(|inner| inner.vspace.free_runs())
    }

    /// Free every object and release the page table's own frames.
    pub fn destroy_address_space(self) {
        // Teardown happens in `Drop`.
        drop(self);
    }

    fn teardown(&mut self) {
        let frames = self.frames;
        let inner = self.inner.get_mut();
        let handles: Vec<ObjectHandle> = inner.by_address.values().copied().collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = inner.release(frames, handle) {
                warn!("page manager: teardown could not release an object: {e}");
            }
        }
        inner.page_table.release_tables(frames);
        info!("page manager: destroyed {:?} address space ({count} objects)", self.kind);
    }

    const fn effective(&self, permissions: Permissions) -> Permissions {
        match self.kind {
            AddressSpaceKind::Kernel => permissions.with_user(false),
            AddressSpaceKind::User => permissions.for_user(),
        }
    }

    fn is_covered(&self, address: VirtualAddress, size: u64, required: Permissions) -> bool {
        if size == 0 {
            return true;
        }
        let Some(end) = address.as_u64().checked_add(size) else {
            return false;
        };
        self.inner.with_lock(|inner| {
            let mut cursor = address.as_u64();
            while cursor < end {
                match inner.object_containing(cursor) {
                    Some((_, o)) if o.state == ObjectState::InUse && o.permissions.allows(required) => {
                        cursor = o.end();
                    }
                    _ => return false,
                }
            }
            true
        })
    }

    fn escalate<T>(&self, result: Result<T, MemoryError>, what: &str, count: u64) -> Result<T, MemoryError> {
        if let Err(e) = &result
            && self.kind == AddressSpaceKind::Kernel
            && e.is_exhaustion()
        {
            crate::fatal!("page manager: kernel address space failed to {what} {count} page(s): {e}");
        }
        result
    }
}

impl<P: PageTableAdapter> Drop for PageManager<'_, P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<P: PageTableAdapter> Inner<P> {
    fn insert(&mut self, object: AllocationObject) -> ObjectHandle {
        let handle = self.objects.insert(object);
        self.by_address.insert(object.base.as_u64(), handle);
        trace!(
            "page manager: {:?} object at {} ({} pages)",
            object.state, object.base, object.pages
        );
        handle
    }

    fn object_containing(&self, address: u64) -> Option<(ObjectHandle, AllocationObject)> {
        let (_, &handle) = self.by_address.range(..=address).next_back()?;
        let object = *self.objects.get(handle)?;
        object.contains(address).then_some((handle, object))
    }

    /// Give an uncommitted virtual claim back after a failed commit.
    fn return_claim(&mut self, base: VirtualAddress, count: u64) {
        if let Err(e) = self.vspace.free(base, count) {
            warn!("page manager: could not return claim at {base}: {e}");
        }
    }

    /// Back `[base, base + pages)` with fresh frames, page by page. On failure
    /// everything mapped so far is undone.
    fn commit(
        &mut self,
        frames: &PhysicalFrameAllocator,
        base: VirtualAddress,
        pages: u64,
        permissions: Permissions,
    ) -> Result<(), MemoryError> {
        for i in 0..pages {
            let va = base + i * PAGE_SIZE;
            let mapped = frames.allocate_frame().and_then(|frame| {
                self.page_table
                    .map_page(frames, va, frame.start_address(), permissions)
                    .map_err(|e| {
                        if let Err(undo) = frames.free_frames(frame, 1) {
                            warn!("page manager: could not free frame {frame} behind {va}: {undo}");
                        }
                        MemoryError::from(e)
                    })
            });
            if let Err(e) = mapped {
                debug!("page manager: commit of {pages} page(s) at {base} failed after {i}: {e}");
                self.decommit(frames, base, i);
                return Err(e);
            }
        }
        self.committed += pages;
        Ok(())
    }

    fn decommit(&mut self, frames: &PhysicalFrameAllocator, base: VirtualAddress, pages: u64) {
        for i in 0..pages {
            let va = base + i * PAGE_SIZE;
            match self.page_table.unmap_page(va) {
                Ok(pa) => {
                    if let Err(e) = frames.free_frames(pa.frame(), 1) {
                        warn!("page manager: could not free frame {pa} behind {va}: {e}");
                    }
                }
                Err(e) => warn!("page manager: {e} during decommit"),
            }
        }
    }

    /// Commit `[address, address + count)` inside the Standby object `handle`,
    /// then split the object around that slice and mark it InUse.
    ///
    /// The object is only split once the commit has succeeded, so a failed
    /// promotion leaves the reservation exactly as it was.
    fn promote(
        &mut self,
        frames: &PhysicalFrameAllocator,
        handle: ObjectHandle,
        address: VirtualAddress,
        count: u64,
    ) -> Result<(), MemoryError> {
        let object = *self.objects.get(handle).ok_or(MemoryError::InvalidRange)?;
        self.commit(frames, address, count, object.permissions)?;
        if let Err(e) = self.carve(handle, object, address, count) {
            self.decommit(frames, address, count);
            self.committed -= count;
            return Err(e);
        }
        trace!("page manager: promoted {count} page(s) at {address}");
        Ok(())
    }

    /// Cut `object` (stored under `handle`) so that `[address, address + count)`
    /// becomes an object of its own, and mark that slice InUse.
    fn carve(
        &mut self,
        handle: ObjectHandle,
        object: AllocationObject,
        address: VirtualAddress,
        count: u64,
    ) -> Result<(), MemoryError> {
        let offset = (address.as_u64() - object.base.as_u64()) / PAGE_SIZE;

        let mut target = handle;
        if offset > 0 {
            self.vspace.split_range(object.base, offset)?;
            let tail = self
                .objects
                .get_mut(handle)
                .ok_or(MemoryError::InvalidRange)?
                .split_off(offset);
            target = self.insert(tail);
        }
        let pages = self.objects.get(target).map_or(0, |o| o.pages);
        if pages > count {
            self.vspace.split_range(address, count)?;
            let tail = self
                .objects
                .get_mut(target)
                .ok_or(MemoryError::InvalidRange)?
                .split_off(count);
            self.insert(tail);
        }

        self.vspace.mark_used(address, count)?;
        if let Some(o) = self.objects.get_mut(target) {
            o.state = ObjectState::InUse;
        }
        Ok(())
    }

    fn release(&mut self, frames: &PhysicalFrameAllocator, handle: ObjectHandle) -> Result<(), MemoryError> {
        let object = self.objects.remove(handle).ok_or(MemoryError::InvalidRange)?;
        self.by_address.remove(&object.base.as_u64());
        if object.state == ObjectState::InUse {
            self.decommit(frames, object.base, object.pages);
            self.committed -= object.pages;
        }
        self.vspace.free(object.base, object.pages)?;
        trace!("page manager: freed {} page(s) at {}", object.pages, object.base);
        Ok(())
    }
}

fn checked_end(address: VirtualAddress, count: u64) -> Option<u64> {
    checked_pages_to_bytes(count).and_then(|bytes| address.as_u64().checked_add(bytes))
}
