//! # Boot-time Frame Allocator
//!
//! The first phase of the two-phase physical allocator. Before the heap (and
//! therefore the bitmap) exists, page-table frames come from a bounded bump
//! allocator walking the usable regions of the memory map. It never frees.
//!
//! [`BootFrameAllocator::retire`] consumes the allocator and yields a
//! [`BootHandoff`] describing everything it handed out;
//! [`PhysicalFrameAllocator::with_handoff`](crate::PhysicalFrameAllocator::with_handoff)
//! then accounts those frames as used. The allocator cannot be used after it
//! has been retired.

use core::cell::Cell;
use kernel_info::memory_map::MemoryMap;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};
use kernel_vmem::FrameSource;
use log::{debug, warn};

/// Most usable regions the boot allocator tracks; later ones are ignored.
pub const MAX_BOOT_REGIONS: usize = 32;

/// Bump allocator over usable RAM. Needs no heap.
pub struct BootFrameAllocator {
    /// Usable `[first, end)` frame runs, in map order.
    regions: [(u64, u64); MAX_BOOT_REGIONS],
    region_count: usize,
    /// Index of the region `next` lies in.
    cursor: Cell<usize>,
    next: Cell<u64>,
    handed_out: Cell<u64>,
    limit: u64,
}

/// Frames handed out during boot, as contiguous runs.
#[derive(Debug, Clone)]
pub struct BootHandoff {
    runs: [(u64, u64); MAX_BOOT_REGIONS],
    run_count: usize,
}

impl BootFrameAllocator {
    /// Build over the usable regions of `map`, handing out at most `limit`
    /// frames in total. Frame 0 is never part of a region.
    pub fn new<M: MemoryMap + ?Sized>(map: &M, limit: u64) -> Self {
        let mut regions = [(0, 0); MAX_BOOT_REGIONS];
        let mut region_count = 0;
        for region in map.regions().filter(|r| r.kind.is_usable()) {
            let (first, end) = region.inner_frames();
            let first = first.max(1);
            if first >= end {
                continue;
            }
            if region_count == MAX_BOOT_REGIONS {
                warn!("boot allocator: ignoring usable region {first}..{end}");
                continue;
            }
            regions[region_count] = (first, end);
            region_count += 1;
        }
        let next = if region_count > 0 { regions[0].0 } else { 0 };
        Self {
            regions,
            region_count,
            cursor: Cell::new(0),
            next: Cell::new(next),
            handed_out: Cell::new(0),
            limit,
        }
    }

    /// Hand out the next usable frame, or `None` once the limit or usable RAM
    /// is exhausted.
    pub fn allocate_frame(&self) -> Option<PhysicalFrame> {
        if self.handed_out.get() >= self.limit {
            return None;
        }
        let mut cursor = self.cursor.get();
        while cursor < self.region_count {
            let (_, end) = self.regions[cursor];
            let next = self.next.get();
            if next < end {
                self.next.set(next + 1);
                self.handed_out.set(self.handed_out.get() + 1);
                return Some(PhysicalFrame::new(next));
            }
            cursor += 1;
            self.cursor.set(cursor);
            if cursor < self.region_count {
                self.next.set(self.regions[cursor].0);
            }
        }
        None
    }

    #[inline]
    #[must_use]
    pub fn frames_handed_out(&self) -> u64 {
        self.handed_out.get()
    }

    /// End the boot phase.
    #[must_use]
    pub fn retire(self) -> BootHandoff {
        let mut runs = [(0, 0); MAX_BOOT_REGIONS];
        let mut run_count = 0;
        let cursor = self.cursor.get();
        for (i, &(first, end)) in self.regions[..self.region_count].iter().enumerate() {
            let used_end = match i.cmp(&cursor) {
                core::cmp::Ordering::Less => end,
                core::cmp::Ordering::Equal => self.next.get(),
                core::cmp::Ordering::Greater => break,
            };
            if used_end > first {
                runs[run_count] = (first, used_end - first);
                run_count += 1;
            }
        }
        debug!(
            "boot allocator: retired after {} frame(s)",
            self.handed_out.get()
        );
        BootHandoff { runs, run_count }
    }
}

impl FrameSource for BootFrameAllocator {
    fn allocate_table_frame(&self) -> Option<PhysicalAddress> {
        self.allocate_frame().map(PhysicalFrame::start_address)
    }

    fn release_table_frame(&self, frame: PhysicalAddress) {
        warn!("boot allocator: cannot free {frame}; it stays in use until the hand-off");
    }
}

impl BootHandoff {
    /// Contiguous `(base, count)` runs of handed-out frames.
    pub fn runs(&self) -> impl Iterator<Item = (PhysicalFrame, u64)> + '_ {
        self.runs[..self.run_count]
            .iter()
            .map(|&(first, count)| (PhysicalFrame::new(first), count))
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.runs[..self.run_count].iter().map(|&(_, n)| n).sum()
    }
}
