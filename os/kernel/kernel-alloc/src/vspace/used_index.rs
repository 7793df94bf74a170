use alloc::collections::BTreeMap;
use kernel_memory_addresses::PAGE_SIZE;

/// Whether a live range is only claimed or backed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RangeKind {
    Reserved,
    Used,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct LiveRange {
    pub pages: u64,
    pub kind: RangeKind,
}

/// Reserved and used ranges keyed by start address.
#[derive(Default)]
pub(crate) struct UsedIndex {
    ranges: BTreeMap<u64, LiveRange>,
    reserved_pages: u64,
    used_pages: u64,
}

impl UsedIndex {
    /// Whether `[start, start + pages)` intersects any live range.
    pub fn overlaps(&self, start: u64, pages: u64) -> bool {
        let end = start + pages * PAGE_SIZE;
        self.ranges
            .range(..end)
            .next_back()
            .is_some_and(|(&s, r)| s + r.pages * PAGE_SIZE > start)
    }

    pub fn insert(&mut self, start: u64, pages: u64, kind: RangeKind) {
        debug_assert!(!self.overlaps(start, pages));
        self.ranges.insert(start, LiveRange { pages, kind });
        *self.counter(kind) += pages;
    }

    pub fn get(&self, start: u64) -> Option<LiveRange> {
        self.ranges.get(&start).copied()
    }

    pub fn remove(&mut self, start: u64) -> Option<LiveRange> {
        let range = self.ranges.remove(&start)?;
        *self.counter(range.kind) -= range.pages;
        Some(range)
    }

    /// The live range containing `address`, with its start.
    pub fn containing(&self, address: u64) -> Option<(u64, LiveRange)> {
        let (&s, &r) = self.ranges.range(..=address).next_back()?;
        (address < s + r.pages * PAGE_SIZE).then_some((s, r))
    }

    /// Change the kind of the range starting at `start`.
    pub fn relabel(&mut self, start: u64, kind: RangeKind) -> Option<()> {
        let range = self.ranges.get_mut(&start)?;
        let (old, pages) = (range.kind, range.pages);
        range.kind = kind;
        *self.counter(old) -= pages;
        *self.counter(kind) += pages;
        Some(())
    }

    /// Cut the range at `start` in two after `offset` pages.
    pub fn split(&mut self, start: u64, offset: u64) -> Option<()> {
        let range = self.ranges.get_mut(&start)?;
        if offset == 0 || offset >= range.pages {
            return None;
        }
        let tail = LiveRange {
            pages: range.pages - offset,
            kind: range.kind,
        };
        range.pages = offset;
        self.ranges.insert(start + offset * PAGE_SIZE, tail);
        Some(())
    }

    #[inline]
    pub const fn reserved_pages(&self) -> u64 {
        self.reserved_pages
    }

    #[inline]
    pub const fn used_pages(&self) -> u64 {
        self.used_pages
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    const fn counter(&mut self, kind: RangeKind) -> &mut u64 {
        match kind {
            RangeKind::Reserved => &mut self.reserved_pages,
            RangeKind::Used => &mut self.used_pages,
        }
    }
}
