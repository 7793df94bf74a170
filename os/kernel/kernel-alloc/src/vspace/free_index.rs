use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use kernel_memory_addresses::PAGE_SIZE;

/// Free virtual runs, indexed by size and by address.
///
/// `by_size` holds one bucket per exact page count; each bucket keeps its
/// start addresses ordered so the lowest candidate is taken first.
/// `by_start` is the address-ordered view used for enclosing-run lookups and
/// for compaction. Adjacent runs are *not* merged on insert; the index only
/// remembers that a merge is due.
#[derive(Default)]
pub(crate) struct FreeIndex {
    by_size: BTreeMap<u64, BTreeSet<u64>>,
    by_start: BTreeMap<u64, u64>,
    pages: u64,
    needs_compaction: bool,
}

#[inline]
const fn end_of(start: u64, pages: u64) -> u64 {
    start + pages * PAGE_SIZE
}

impl FreeIndex {
    pub fn insert(&mut self, start: u64, pages: u64) {
        debug_assert!(pages > 0);
        debug_assert!(!self.by_start.contains_key(&start));
        let end = end_of(start, pages);
        let touches_left = self
            .by_start
            .range(..start)
            .next_back()
            .is_some_and(|(&s, &p)| end_of(s, p) == start);
        let touches_right = self.by_start.contains_key(&end);
        if touches_left || touches_right {
            self.needs_compaction = true;
        }

        self.by_start.insert(start, pages);
        self.by_size.entry(pages).or_default().insert(start);
        self.pages += pages;
    }

    /// Remove the run starting exactly at `start`.
    pub fn remove(&mut self, start: u64) -> Option<u64> {
        let pages = self.by_start.remove(&start)?;
        if let Some(bucket) = self.by_size.get_mut(&pages) {
            bucket.remove(&start);
            if bucket.is_empty() {
                self.by_size.remove(&pages);
            }
        }
        self.pages -= pages;
        Some(pages)
    }

    /// Take the lowest-addressed run from the smallest bucket holding at
    /// least `count` pages. Not a best-fit scan over all runs.
    pub fn take_smallest_fit(&mut self, count: u64) -> Option<(u64, u64)> {
        let (_, bucket) = self.by_size.range(count..).next()?;
        let start = *bucket.first()?;
        let pages = self.remove(start)?;
        Some((start, pages))
    }

    /// The run that fully contains `[start, start + pages)`.
    pub fn enclosing(&self, start: u64, pages: u64) -> Option<(u64, u64)> {
        let (&s, &p) = self.by_start.range(..=start).next_back()?;
        (end_of(s, p) >= end_of(start, pages)).then_some((s, p))
    }

    /// Coalesce adjacent runs. Returns the number of merges performed.
    pub fn compact(&mut self) -> usize {
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.by_start.len());
        let mut merges = 0;
        for (&start, &pages) in &self.by_start {
            match merged.last_mut() {
                Some((s, p)) if end_of(*s, *p) == start => {
                    *p += pages;
                    merges += 1;
                }
                _ => merged.push((start, pages)),
            }
        }
        self.needs_compaction = false;
        if merges == 0 {
            return 0;
        }

        self.by_size.clear();
        self.by_start.clear();
        for &(start, pages) in &merged {
            self.by_start.insert(start, pages);
            self.by_size.entry(pages).or_default().insert(start);
        }
        merges
    }

    #[inline]
    pub const fn needs_compaction(&self) -> bool {
        self.needs_compaction
    }

    #[inline]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    pub fn largest(&self) -> u64 {
        self.by_size.last_key_value().map_or(0, |(&p, _)| p)
    }

    pub fn runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_start.iter().map(|(&s, &p)| (s, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE;

    #[test]
    fn smallest_bucket_wins_then_lowest_address() {
        let mut idx = FreeIndex::default();
        idx.insert(0, 8);
        idx.insert(20 * P, 3);
        idx.insert(40 * P, 3);
        idx.insert(60 * P, 5);
        assert_eq!(idx.take_smallest_fit(3), Some((20 * P, 3)));
        assert_eq!(idx.take_smallest_fit(4), Some((60 * P, 5)));
        assert_eq!(idx.take_smallest_fit(9), None);
        assert_eq!(idx.pages(), 8 + 3);
    }

    #[test]
    fn insert_flags_but_does_not_merge_neighbours() {
        let mut idx = FreeIndex::default();
        idx.insert(0, 2);
        idx.insert(4 * P, 2);
        assert!(!idx.needs_compaction());
        idx.insert(2 * P, 2);
        assert!(idx.needs_compaction());
        assert_eq!(idx.runs().count(), 3);

        assert_eq!(idx.compact(), 2);
        assert_eq!(idx.runs().collect::<Vec<_>>(), vec![(0, 6)]);
        assert!(!idx.needs_compaction());
        assert_eq!(idx.largest(), 6);
        assert_eq!(idx.pages(), 6);
    }

    #[test]
    fn enclosing_requires_full_cover() {
        let mut idx = FreeIndex::default();
        idx.insert(4 * P, 4);
        assert_eq!(idx.enclosing(5 * P, 3), Some((4 * P, 4)));
        assert_eq!(idx.enclosing(5 * P, 4), None);
        assert_eq!(idx.enclosing(2 * P, 1), None);
    }
}
