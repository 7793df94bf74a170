//! # Physical Frame Allocator
//!
//! System-wide bitmap of 4 KiB frames. One bit per frame in the *occupancy*
//! map (set iff the frame is reserved or used) plus a *reserved* sub-map that
//! tells the two apart, so freeing a reserved frame can never make it
//! allocatable.
//!
//! ## Scan hint
//!
//! The allocator remembers the frame following the most recently freed range
//! (and, after an allocation, the frame following the allocated run). Scans
//! start there and wrap around once, so single-frame allocation after a free
//! is O(1) amortized and a frame freed below the hint is still found.
//!
//! ## Frame 0
//!
//! Frame 0 is always reserved. [`unreserve_frames`](PhysicalFrameAllocator::unreserve_frames)
//! skips it, and a scan that nevertheless produced it is a fatal invariant
//! violation.
//!
//! ## Concurrency
//!
//! All state sits behind one [`IrqSpinLock`]; callers may run in interrupt
//! context and nothing here ever blocks.

use crate::MemoryError;
use crate::bootstrap::BootHandoff;
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory_map::MemoryMap;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_sync::IrqSpinLock;
use kernel_vmem::FrameSource;
use log::{debug, info, trace, warn};

const BITS: u64 = u64::BITS as u64;

/// Snapshot of frame accounting.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct FrameStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub reserved: u64,
}

/// Bitmap allocator for physical frames.
pub struct PhysicalFrameAllocator {
    state: IrqSpinLock<FrameBitmap>,
}

struct FrameBitmap {
    /// Set iff reserved or used.
    occupied: Vec<u64>,
    /// Set iff reserved; always a subset of `occupied`.
    reserved: Vec<u64>,
    total: u64,
    used: u64,
    reserved_count: u64,
    hint: u64,
}

impl PhysicalFrameAllocator {
    /// Seed the bitmap from the firmware memory map.
    ///
    /// `total_bytes` bounds the managed range; regions beyond it are clipped.
    /// Everything starts out reserved. Usable regions are then released,
    /// rounded inward to whole frames, and every other region is reserved
    /// again, rounded outward, so a reserved region always wins an overlap.
    pub fn initialize<M: MemoryMap + ?Sized>(map: &M, total_bytes: u64) -> Self {
        let total = total_bytes / PAGE_SIZE;
        let mut bitmap = FrameBitmap::all_reserved(total);

        for region in map.regions().filter(|r| r.kind.is_usable()) {
            let (first, end) = region.inner_frames();
            for frame in first..end.min(total) {
                bitmap.release_reserved(frame);
            }
        }
        for region in map.regions().filter(|r| !r.kind.is_usable()) {
            let (first, end) = region.outer_frames();
            for frame in first..end.min(total) {
                bitmap.mark_reserved(frame);
            }
        }
        // Frame 0 is pinned whenever it is managed at all.
        if total > 0 {
            bitmap.mark_reserved(0);
        }
        bitmap.hint = 1.min(total);

        info!(
            "frame allocator: {total} frames, {} free, {} reserved",
            bitmap.free_count(),
            bitmap.reserved_count
        );
        Self {
            state: IrqSpinLock::new(bitmap),
        }
    }

    /// Seed from the memory map, then account every frame the boot allocator
    /// handed out as used.
    pub fn with_handoff<M: MemoryMap + ?Sized>(
        map: &M,
        total_bytes: u64,
        handoff: &BootHandoff,
    ) -> Self {
        let this = Self::initialize(map, total_bytes);
        {
            let mut bitmap = this.state.lock();
            for (base, count) in handoff.runs() {
                let first = base.number();
                for frame in first..first.saturating_add(count).min(bitmap.total) {
                    if bitmap.is_occupied(frame) {
                        warn!("frame allocator: boot frame {frame} is not usable RAM");
                        continue;
                    }
                    bitmap.set(frame);
                    bitmap.used += 1;
                }
            }
            debug!(
                "frame allocator: adopted {} boot frames",
                handoff.frame_count()
            );
        }
        this
    }

    /// Find and claim `count` contiguous frames.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] for `count == 0`,
    /// [`MemoryError::OutOfPhysicalMemory`] if no run is long enough.
    pub fn allocate_frames(&self, count: u64) -> Result<PhysicalFrame, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidRange);
        }
        let mut bitmap = self.state.lock();
        let total = bitmap.total;
        let hint = bitmap.hint;
        let base = bitmap
            .find_run(hint, total, count)
            .or_else(|| bitmap.find_run(0, total, count))
            .ok_or(MemoryError::OutOfPhysicalMemory)?;

        if base == 0 {
            crate::fatal!("frame allocator: frame 0 was about to be handed out");
        }

        for frame in base..base + count {
            bitmap.set(frame);
        }
        bitmap.used += count;
        bitmap.hint = if base + count >= total { 0 } else { base + count };
        trace!("frame allocator: allocated {count} frame(s) at {base}");
        Ok(PhysicalFrame::new(base))
    }

    /// Single-frame convenience for [`allocate_frames`](Self::allocate_frames).
    ///
    /// # Errors
    /// [`MemoryError::OutOfPhysicalMemory`] on exhaustion.
    #[inline]
    pub fn allocate_frame(&self) -> Result<PhysicalFrame, MemoryError> {
        self.allocate_frames(1)
    }

    /// Return `count` frames starting at `base`.
    ///
    /// Freeing an already free frame, or a reserved one, is logged and
    /// ignored (with the `strict-free` feature it is reported instead and
    /// nothing is changed).
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if the range leaves the managed memory.
    pub fn free_frames(&self, base: PhysicalFrame, count: u64) -> Result<(), MemoryError> {
        let mut bitmap = self.state.lock();
        let first = base.number();
        let end = bitmap.checked_end(first, count)?;

        if cfg!(feature = "strict-free")
            && (first..end).any(|f| !bitmap.is_occupied(f) || bitmap.is_reserved(f))
        {
            warn!("frame allocator: rejected free of {count} frame(s) at {first}");
            return Err(MemoryError::InvalidRange);
        }

        let mut freed = 0;
        for frame in first..end {
            if bitmap.is_reserved(frame) {
                warn!("frame allocator: ignoring free of reserved frame {frame}");
            } else if !bitmap.is_occupied(frame) {
                warn!("frame allocator: ignoring double free of frame {frame}");
            } else {
                bitmap.clear(frame);
                freed += 1;
            }
        }
        bitmap.used -= freed;
        bitmap.hint = if end >= bitmap.total { 0 } else { end };
        trace!("frame allocator: freed {freed} frame(s) at {first}");
        Ok(())
    }

    /// Withdraw frames from availability without counting them as used.
    ///
    /// Re-reserving an already reserved frame is harmless.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if the range leaves the managed memory,
    /// [`MemoryError::DoubleReservation`] if any frame is in use. Nothing is
    /// changed on error.
    pub fn reserve_frames(&self, base: PhysicalFrame, count: u64) -> Result<(), MemoryError> {
        let mut bitmap = self.state.lock();
        let first = base.number();
        let end = bitmap.checked_end(first, count)?;

        if (first..end).any(|f| bitmap.is_occupied(f) && !bitmap.is_reserved(f)) {
            return Err(MemoryError::DoubleReservation);
        }
        for frame in first..end {
            bitmap.mark_reserved(frame);
        }
        trace!("frame allocator: reserved {count} frame(s) at {first}");
        Ok(())
    }

    /// Return reserved frames to availability. Frame 0 stays reserved.
    ///
    /// Unreserving a frame that is not reserved is logged and ignored (with
    /// `strict-free` it is reported and nothing is changed).
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if the range leaves the managed memory.
    pub fn unreserve_frames(&self, base: PhysicalFrame, count: u64) -> Result<(), MemoryError> {
        let mut bitmap = self.state.lock();
        let first = base.number();
        let end = bitmap.checked_end(first, count)?;

        if cfg!(feature = "strict-free") && (first..end).any(|f| f != 0 && !bitmap.is_reserved(f))
        {
            warn!("frame allocator: rejected unreserve of {count} frame(s) at {first}");
            return Err(MemoryError::InvalidRange);
        }

        for frame in first..end {
            if frame == 0 {
                continue;
            }
            if bitmap.is_reserved(frame) {
                bitmap.release_reserved(frame);
            } else {
                warn!("frame allocator: ignoring unreserve of non-reserved frame {frame}");
            }
        }
        trace!("frame allocator: unreserved {count} frame(s) at {first}");
        Ok(())
    }

    /// Whether `frame` is managed and currently available.
    #[must_use]
    pub fn is_frame_free(&self, frame: PhysicalFrame) -> bool {
        let bitmap = self.state.lock();
        frame.number() < bitmap.total && !bitmap.is_occupied(frame.number())
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let bitmap = self.state.lock();
        FrameStats {
            total: bitmap.total,
            free: bitmap.free_count(),
            used: bitmap.used,
            reserved: bitmap.reserved_count,
        }
    }
}

impl FrameSource for PhysicalFrameAllocator {
    fn allocate_table_frame(&self) -> Option<PhysicalAddress> {
        self.allocate_frame().ok().map(PhysicalFrame::start_address)
    }

    fn release_table_frame(&self, frame: PhysicalAddress) {
        if let Err(e) = self.free_frames(frame.frame(), 1) {
            warn!("frame allocator: failed to release table frame {frame}: {e}");
        }
    }
}

impl FrameBitmap {
    fn all_reserved(total: u64) -> Self {
        let words = usize::try_from(total.div_ceil(BITS)).unwrap_or(usize::MAX);
        Self {
            occupied: vec![u64::MAX; words],
            reserved: vec![u64::MAX; words],
            total,
            used: 0,
            reserved_count: total,
            hint: 0,
        }
    }

    #[inline]
    const fn split(frame: u64) -> (usize, u64) {
        ((frame / BITS) as usize, 1 << (frame % BITS))
    }

    #[inline]
    fn is_occupied(&self, frame: u64) -> bool {
        let (w, m) = Self::split(frame);
        self.occupied[w] & m != 0
    }

    #[inline]
    fn is_reserved(&self, frame: u64) -> bool {
        let (w, m) = Self::split(frame);
        self.reserved[w] & m != 0
    }

    #[inline]
    fn set(&mut self, frame: u64) {
        let (w, m) = Self::split(frame);
        self.occupied[w] |= m;
    }

    #[inline]
    fn clear(&mut self, frame: u64) {
        let (w, m) = Self::split(frame);
        self.occupied[w] &= !m;
    }

    /// Reserve a free frame, or re-label a used one as reserved.
    fn mark_reserved(&mut self, frame: u64) {
        if self.is_reserved(frame) {
            return;
        }
        if self.is_occupied(frame) {
            self.used -= 1;
        }
        let (w, m) = Self::split(frame);
        self.occupied[w] |= m;
        self.reserved[w] |= m;
        self.reserved_count += 1;
    }

    fn release_reserved(&mut self, frame: u64) {
        if !self.is_reserved(frame) {
            return;
        }
        let (w, m) = Self::split(frame);
        self.occupied[w] &= !m;
        self.reserved[w] &= !m;
        self.reserved_count -= 1;
    }

    const fn free_count(&self) -> u64 {
        self.total - self.used - self.reserved_count
    }

    fn checked_end(&self, first: u64, count: u64) -> Result<u64, MemoryError> {
        match first.checked_add(count) {
            Some(end) if count > 0 && end <= self.total => Ok(end),
            _ => Err(MemoryError::InvalidRange),
        }
    }

    /// First run of `count` clear bits fully inside `[start, end)`.
    fn find_run(&self, start: u64, end: u64, count: u64) -> Option<u64> {
        let mut run_start = start;
        let mut run_len = 0;
        let mut frame = start;
        while frame < end {
            if run_len == 0 && frame % BITS == 0 && self.occupied[(frame / BITS) as usize] == u64::MAX {
                frame += BITS;
                run_start = frame;
                continue;
            }
            if self.is_occupied(frame) {
                run_len = 0;
                run_start = frame + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            frame += 1;
        }
        None
    }
}
