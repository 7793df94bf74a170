//! # Virtual Address Space Allocator
//!
//! Bookkeeping for one address-space window, independent of any physical
//! backing.
//!
//! ```text
//!  base                                                     base + pages
//!   ├────────┬──────────┬──────────────┬──────────┬────────────┤
//!   │  used  │   free   │   reserved   │   free   │    free    │
//!   └────────┴──────────┴──────────────┴──────────┴────────────┘
//!              └── FreeIndex (by size, by start) ──┘
//!   └ UsedIndex (by start) ┘
//! ```
//!
//! Free runs live in a size-bucketed [`FreeIndex`]; reserved and used ranges
//! live in an address-keyed [`UsedIndex`]. Every page of the window is in
//! exactly one of them (`free + reserved + used == total`).
//!
//! ## Policy
//!
//! - **FindFree** takes the smallest *bucket* with at least the requested
//!   page count (lowest address inside that bucket) and splits off the
//!   remainder. It is not a best-fit scan across all runs.
//! - **Free** requires an exact `(address, count)` match and reinserts the
//!   range without merging neighbours. Adjacency is only recorded; the next
//!   allocation that consults the free index runs
//!   [`compact_free_ranges`](AddressSpaceAllocator::compact_free_ranges)
//!   first. It can also be called explicitly.
//!
//! ## Locking
//!
//! One [`SpinLock`] each for the free index, the used index and the window
//! bounds. No operation holds two of them at once. Multi-step sequences are
//! therefore only atomic under an outer lock, which
//! [`PageManager`](crate::PageManager) provides.

mod free_index;
mod used_index;

pub use used_index::RangeKind;

use crate::MemoryError;
use alloc::vec::Vec;
use free_index::FreeIndex;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, checked_pages_to_bytes};
use kernel_sync::SpinLock;
use log::{debug, trace, warn};
use used_index::UsedIndex;

/// Page accounting for one window.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct VirtualSpaceStats {
    pub total: u64,
    pub free: u64,
    pub reserved: u64,
    pub used: u64,
    /// Number of distinct free runs (before compaction).
    pub free_runs: usize,
    /// Number of reserved or used ranges.
    pub live_ranges: usize,
}

#[derive(Copy, Clone)]
struct Window {
    base: u64,
    pages: u64,
    max_pages: u64,
}

impl Window {
    const fn end(&self) -> u64 {
        self.base + self.pages * PAGE_SIZE
    }
}

/// Free and live virtual ranges of one address space.
pub struct AddressSpaceAllocator {
    free: SpinLock<FreeIndex>,
    used: SpinLock<UsedIndex>,
    window: SpinLock<Window>,
}

impl AddressSpaceAllocator {
    /// A window of `pages` pages at `base`, growable to `max_pages`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if `base` is not page aligned,
    /// `pages > max_pages`, or the largest window would wrap the address space.
    pub fn new(base: VirtualAddress, pages: u64, max_pages: u64) -> Result<Self, MemoryError> {
        if !base.is_aligned() || pages > max_pages {
            return Err(MemoryError::InvalidRange);
        }
        // The maximal window must stay addressable so `expand_right` never overflows.
        checked_pages_to_bytes(max_pages)
            .and_then(|bytes| base.as_u64().checked_add(bytes))
            .ok_or(MemoryError::InvalidRange)?;

        let mut free = FreeIndex::default();
        if pages > 0 {
            free.insert(base.as_u64(), pages);
        }
        debug!("address space: window {base} with {pages} pages (max {max_pages})");
        Ok(Self {
            free: SpinLock::new(free),
            used: SpinLock::new(UsedIndex::default()),
            window: SpinLock::new(Window {
                base: base.as_u64(),
                pages,
                max_pages,
            }),
        })
    }

    /// Claim the first fit of `count` pages out of the free index.
    ///
    /// The claimed range belongs to neither index afterwards; the caller
    /// records it as reserved or used.
    pub(crate) fn find_free(&self, count: u64) -> Result<u64, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidRange);
        }
        let mut free = self.free.lock();
        if free.needs_compaction() {
            free.compact();
        }
        let (start, pages) = free
            .take_smallest_fit(count)
            .ok_or(MemoryError::OutOfVirtualSpace)?;
        if pages > count {
            free.insert(start + count * PAGE_SIZE, pages - count);
        }
        Ok(start)
    }

    /// Find `count` free pages and record them as used.
    ///
    /// # Errors
    /// [`MemoryError::OutOfVirtualSpace`] if no run is large enough,
    /// [`MemoryError::InvalidRange`] for `count == 0`.
    pub fn allocate(&self, count: u64) -> Result<VirtualAddress, MemoryError> {
        let start = self.find_free(count)?;
        self.used.lock().insert(start, count, RangeKind::Used);
        trace!("address space: allocated {count} page(s) at {start:#x}");
        Ok(VirtualAddress::new(start))
    }

    /// Find `count` free pages and record them as reserved.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate).
    pub fn reserve_any(&self, count: u64) -> Result<VirtualAddress, MemoryError> {
        let start = self.find_free(count)?;
        self.used.lock().insert(start, count, RangeKind::Reserved);
        trace!("address space: reserved {count} page(s) at {start:#x}");
        Ok(VirtualAddress::new(start))
    }

    /// Claim exactly `[address, address + count)` as used.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if the range is misaligned, outside the
    /// window, or not entirely free.
    pub fn allocate_at(&self, address: VirtualAddress, count: u64) -> Result<(), MemoryError> {
        self.claim_at(address, count, RangeKind::Used)
            .map_err(|e| match e {
                MemoryError::DoubleReservation => MemoryError::InvalidRange,
                e => e,
            })
    }

    /// Claim exactly `[address, address + count)` as reserved.
    ///
    /// # Errors
    /// [`MemoryError::DoubleReservation`] if any page is already reserved or
    /// used, [`MemoryError::InvalidRange`] if misaligned or outside the window.
    pub fn reserve(&self, address: VirtualAddress, count: u64) -> Result<(), MemoryError> {
        self.claim_at(address, count, RangeKind::Reserved)
    }

    fn claim_at(&self, address: VirtualAddress, count: u64, kind: RangeKind) -> Result<(), MemoryError> {
        let start = address.as_u64();
        self.check_bounds(address, count)?;
        if self.used.lock().overlaps(start, count) {
            return Err(MemoryError::DoubleReservation);
        }

        {
            let mut free = self.free.lock();
            if free.needs_compaction() {
                free.compact();
            }
            let (run, pages) = free
                .enclosing(start, count)
                .ok_or(MemoryError::InvalidRange)?;
            free.remove(run);
            if start > run {
                free.insert(run, (start - run) / PAGE_SIZE);
            }
            let claimed_end = start + count * PAGE_SIZE;
            let run_end = run + pages * PAGE_SIZE;
            if run_end > claimed_end {
                free.insert(claimed_end, (run_end - claimed_end) / PAGE_SIZE);
            }
        }

        self.used.lock().insert(start, count, kind);
        trace!("address space: claimed {count} page(s) at {address} as {kind:?}");
        Ok(())
    }

    /// Return a reserved or used range to the free index.
    ///
    /// `address` and `count` must match a live range exactly. Freeing an
    /// address that starts no live range is logged and ignored (reported as
    /// [`MemoryError::InvalidRange`] with the `strict-free` feature).
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] for a partial free: `address` inside a
    /// live range, or a `count` that differs from the recorded one.
    pub fn free(&self, address: VirtualAddress, count: u64) -> Result<(), MemoryError> {
        self.release(address, count, None)
    }

    /// Return a *reserved* range to the free index.
    ///
    /// # Errors
    /// As [`free`](Self::free); additionally [`MemoryError::InvalidRange`] if
    /// the range is used rather than reserved.
    pub fn unreserve(&self, address: VirtualAddress, count: u64) -> Result<(), MemoryError> {
        self.release(address, count, Some(RangeKind::Reserved))
    }

    fn release(
        &self,
        address: VirtualAddress,
        count: u64,
        required: Option<RangeKind>,
    ) -> Result<(), MemoryError> {
        let start = address.as_u64();
        {
            let mut used = self.used.lock();
            match used.get(start) {
                Some(range) => {
                    if range.pages != count || required.is_some_and(|k| k != range.kind) {
                        return Err(MemoryError::InvalidRange);
                    }
                    used.remove(start);
                }
                None if used.containing(start).is_some() => {
                    return Err(MemoryError::InvalidRange);
                }
                None if cfg!(feature = "strict-free") => {
                    warn!("address space: rejected release of unknown range {address}");
                    return Err(MemoryError::InvalidRange);
                }
                None => {
                    warn!("address space: ignoring release of unknown range {address}");
                    return Ok(());
                }
            }
        }
        self.free.lock().insert(start, count);
        trace!("address space: released {count} page(s) at {address}");
        Ok(())
    }

    /// Cut the live range starting at `address` in two after `offset` pages.
    /// Both halves keep the original kind.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if no live range starts at `address` or
    /// `offset` is not strictly inside it.
    pub fn split_range(&self, address: VirtualAddress, offset: u64) -> Result<(), MemoryError> {
        self.used
            .lock()
            .split(address.as_u64(), offset)
            .ok_or(MemoryError::InvalidRange)
    }

    /// Turn the reserved range `[address, address + count)` into a used one.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] unless a reserved range of exactly that
    /// extent exists.
    pub fn mark_used(&self, address: VirtualAddress, count: u64) -> Result<(), MemoryError> {
        let mut used = self.used.lock();
        match used.get(address.as_u64()) {
            Some(r) if r.pages == count && r.kind == RangeKind::Reserved => {
                used.relabel(address.as_u64(), RangeKind::Used);
                Ok(())
            }
            _ => Err(MemoryError::InvalidRange),
        }
    }

    /// Merge adjacent free runs. Returns the number of merges.
    ///
    /// Idempotent: a second call without intervening mutation merges nothing.
    pub fn compact_free_ranges(&self) -> usize {
        let merges = self.free.lock().compact();
        if merges > 0 {
            debug!("address space: compaction merged {merges} run(s)");
        }
        merges
    }

    /// Grow the window to `new_pages` pages. The new tail becomes one free run.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if `new_pages` would shrink the window,
    /// [`MemoryError::OutOfVirtualSpace`] if it exceeds the window's limit.
    pub fn expand_right(&self, new_pages: u64) -> Result<(), MemoryError> {
        let (tail, added) = {
            let mut window = self.window.lock();
            if new_pages < window.pages {
                return Err(MemoryError::InvalidRange);
            }
            if new_pages > window.max_pages {
                return Err(MemoryError::OutOfVirtualSpace);
            }
            let tail = window.end();
            let added = new_pages - window.pages;
            window.pages = new_pages;
            (tail, added)
        };
        if added > 0 {
            self.free.lock().insert(tail, added);
            debug!("address space: grew by {added} page(s) to {new_pages}");
        }
        Ok(())
    }

    /// Whether `address` lies inside the window.
    #[must_use]
    pub fn contains(&self, address: VirtualAddress) -> bool {
        let window = *self.window.lock();
        (window.base..window.end()).contains(&address.as_u64())
    }

    /// `(base, pages)` of the window.
    #[must_use]
    pub fn bounds(&self) -> (VirtualAddress, u64) {
        let window = *self.window.lock();
        (VirtualAddress::new(window.base), window.pages)
    }

    /// Page count of the largest single free run (without compacting).
    #[must_use]
    pub fn largest_free_run(&self) -> u64 {
        self.free.lock().largest()
    }

    /// Address-ordered snapshot of the free runs as `(start, pages)`.
    #[must_use]
    pub fn free_runs(&self) -> Vec<(VirtualAddress, u64)> {
        self.free
            .lock()
            .runs()
            .map(|(s, p)| (VirtualAddress::new(s), p))
            .collect()
    }

    /// The live range containing `address`, as `(start, pages, kind)`.
    #[must_use]
    pub fn range_containing(&self, address: VirtualAddress) -> Option<(VirtualAddress, u64, RangeKind)> {
        self.used
            .lock()
            .containing(address.as_u64())
            .map(|(s, r)| (VirtualAddress::new(s), r.pages, r.kind))
    }

    #[must_use]
    pub fn stats(&self) -> VirtualSpaceStats {
        let total = self.window.lock().pages;
        let (free, free_runs) = {
            let f = self.free.lock();
            (f.pages(), f.runs().count())
        };
        let used = self.used.lock();
        VirtualSpaceStats {
            total,
            free,
            reserved: used.reserved_pages(),
            used: used.used_pages(),
            free_runs,
            live_ranges: used.len(),
        }
    }

    fn check_bounds(&self, address: VirtualAddress, count: u64) -> Result<(), MemoryError> {
        let window = *self.window.lock();
        let start = address.as_u64();
        let end = checked_pages_to_bytes(count).and_then(|b| start.checked_add(b));
        match end {
            Some(end) if count > 0 && address.is_aligned() && start >= window.base && end <= window.end() => Ok(()),
            _ => Err(MemoryError::InvalidRange),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE;

    fn va(page: u64) -> VirtualAddress {
        VirtualAddress::new(page * P)
    }

    fn window(pages: u64) -> AddressSpaceAllocator {
        AddressSpaceAllocator::new(VirtualAddress::zero(), pages, pages * 4).unwrap()
    }

    fn assert_accounted(asa: &AddressSpaceAllocator) {
        let s = asa.stats();
        assert_eq!(s.free + s.reserved + s.used, s.total, "{s:?}");
    }

    #[test]
    fn find_free_splits_off_remainder() {
        let asa = window(16);
        assert_eq!(asa.allocate(5), Ok(va(0)));
        assert_eq!(asa.free_runs(), vec![(va(5), 11)]);
        assert_accounted(&asa);
    }

    #[test]
    fn smallest_bucket_is_preferred_over_lower_address() {
        let asa = window(32);
        let a = asa.allocate(10).unwrap();
        let _guard = asa.allocate(1).unwrap();
        let b = asa.allocate(4).unwrap();
        let _guard2 = asa.allocate(1).unwrap();
        asa.free(a, 10).unwrap();
        asa.free(b, 4).unwrap();
        // Buckets 4, 10 and 16: a 3-page request lands in the 4-page run.
        assert_eq!(asa.allocate(3), Ok(b));
    }

    #[test]
    fn allocate_at_splits_enclosing_run_into_two_residuals() {
        let asa = window(16);
        asa.allocate_at(va(4), 3).unwrap();
        assert_eq!(asa.free_runs(), vec![(va(0), 4), (va(7), 9)]);
        assert_eq!(asa.allocate_at(va(6), 2), Err(MemoryError::InvalidRange));
        assert_eq!(asa.allocate_at(va(15), 2), Err(MemoryError::InvalidRange));
        assert_eq!(
            asa.allocate_at(VirtualAddress::new(0x10), 1),
            Err(MemoryError::InvalidRange)
        );
        assert_accounted(&asa);
    }

    #[test]
    fn reserving_a_live_range_twice_fails() {
        let asa = window(16);
        asa.reserve(va(2), 4).unwrap();
        assert_eq!(asa.reserve(va(2), 4), Err(MemoryError::DoubleReservation));
        assert_eq!(asa.reserve(va(5), 1), Err(MemoryError::DoubleReservation));
        assert_eq!(asa.stats().reserved, 4);
        assert_accounted(&asa);
    }

    #[test]
    fn free_requires_exact_match() {
        let asa = window(16);
        let a = asa.allocate(4).unwrap();
        assert_eq!(asa.free(a, 3), Err(MemoryError::InvalidRange));
        assert_eq!(asa.free(va(1), 3), Err(MemoryError::InvalidRange));
        asa.free(a, 4).unwrap();
        assert_accounted(&asa);
    }

    #[cfg(not(feature = "strict-free"))]
    #[test]
    fn double_free_is_tolerated() {
        let asa = window(16);
        let a = asa.allocate(4).unwrap();
        asa.free(a, 4).unwrap();
        let before = asa.stats();
        asa.free(a, 4).unwrap();
        assert_eq!(asa.stats(), before);
    }

    #[cfg(feature = "strict-free")]
    #[test]
    fn double_free_is_reported() {
        let asa = window(16);
        let a = asa.allocate(4).unwrap();
        asa.free(a, 4).unwrap();
        assert_eq!(asa.free(a, 4), Err(MemoryError::InvalidRange));
    }

    #[test]
    fn unreserve_only_accepts_reserved_ranges() {
        let asa = window(16);
        let used = asa.allocate(2).unwrap();
        let reserved = asa.reserve_any(2).unwrap();
        assert_eq!(asa.unreserve(used, 2), Err(MemoryError::InvalidRange));
        asa.unreserve(reserved, 2).unwrap();
        assert_eq!(asa.stats().reserved, 0);
        assert_accounted(&asa);
    }

    #[test]
    fn free_does_not_merge_eagerly() {
        let asa = window(16);
        let a = asa.allocate(4).unwrap();
        asa.free(a, 4).unwrap();
        assert_eq!(asa.free_runs(), vec![(va(0), 4), (va(4), 12)]);
        assert_eq!(asa.compact_free_ranges(), 1);
        assert_eq!(asa.free_runs(), vec![(va(0), 16)]);
    }

    #[test]
    fn compaction_is_idempotent() {
        let asa = window(32);
        let runs: Vec<_> = (0..6).map(|_| asa.allocate(3).unwrap()).collect();
        for &r in runs.iter().step_by(2) {
            asa.free(r, 3).unwrap();
        }
        asa.free(runs[1], 3).unwrap();
        asa.compact_free_ranges();
        let first = asa.free_runs();
        assert_eq!(asa.compact_free_ranges(), 0);
        assert_eq!(asa.free_runs(), first);
    }

    #[test]
    fn allocation_after_free_sees_merged_runs() {
        let asa = window(16);
        let a = asa.allocate(5).unwrap();
        asa.free(a, 5).unwrap();
        // Neither piece alone holds 12 pages; the pending merge does.
        assert_eq!(asa.allocate(12), Ok(va(0)));
        assert_accounted(&asa);
    }

    #[test]
    fn largest_run_boundary() {
        let asa = window(16);
        asa.allocate_at(va(6), 1).unwrap();
        assert_eq!(asa.largest_free_run(), 9);
        assert_eq!(asa.allocate(10), Err(MemoryError::OutOfVirtualSpace));
        assert_eq!(asa.allocate(9), Ok(va(7)));
        assert_eq!(asa.largest_free_run(), 6);
    }

    #[test]
    fn expand_right_adds_one_tail_run() {
        let asa = AddressSpaceAllocator::new(va(16), 8, 20).unwrap();
        asa.allocate(8).unwrap();
        assert_eq!(asa.allocate(1), Err(MemoryError::OutOfVirtualSpace));
        asa.expand_right(12).unwrap();
        assert_eq!(asa.free_runs(), vec![(va(24), 4)]);
        assert_eq!(asa.bounds(), (va(16), 12));
        assert!(asa.contains(va(27)));
        assert!(!asa.contains(va(28)));
        assert_eq!(asa.expand_right(21), Err(MemoryError::OutOfVirtualSpace));
        assert_eq!(asa.expand_right(11), Err(MemoryError::InvalidRange));
        assert_accounted(&asa);
    }

    #[test]
    fn split_and_mark_used() {
        let asa = window(16);
        let r = asa.reserve_any(6).unwrap();
        asa.split_range(r, 2).unwrap();
        assert_eq!(asa.mark_used(va(2), 4), Ok(()));
        assert_eq!(asa.mark_used(va(2), 4), Err(MemoryError::InvalidRange));
        assert_eq!(asa.range_containing(va(3)), Some((va(2), 4, RangeKind::Used)));
        assert_eq!(asa.range_containing(va(1)), Some((va(0), 2, RangeKind::Reserved)));
        assert_eq!(asa.split_range(va(1), 1), Err(MemoryError::InvalidRange));
        let s = asa.stats();
        assert_eq!((s.reserved, s.used, s.live_ranges), (2, 4, 2));
    }

    #[test]
    fn rejects_bad_windows() {
        assert!(AddressSpaceAllocator::new(VirtualAddress::new(0x10), 1, 1).is_err());
        assert!(AddressSpaceAllocator::new(VirtualAddress::zero(), 2, 1).is_err());
        assert!(AddressSpaceAllocator::new(VirtualAddress::new(u64::MAX - 0xfff), 1, 2).is_err());
    }

    #[test]
    fn zero_pages_are_invalid() {
        let asa = window(4);
        assert_eq!(asa.allocate(0), Err(MemoryError::InvalidRange));
        assert_eq!(asa.reserve(va(0), 0), Err(MemoryError::InvalidRange));
    }
}
