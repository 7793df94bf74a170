//! # Memory Page Table
//!
//! One 4 KiB-aligned table of 512 [`PageEntryBits`]. The same type serves every
//! level of the walk; the level only decides how an entry is interpreted.

use crate::PageEntryBits;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries per table.
pub const ENTRIES: usize = 512;

/// A page table at any level: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntryBits {
        self.entries[i]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntryBits) {
        self.entries[i] = e;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}

/// Split a virtual address into its (PML4, PDPT, PD, PT) indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [usize; 4] {
    let v = va.as_u64();
    [
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        for i in split_indices(va) {
            assert!(i < ENTRIES);
        }
        let va = VirtualAddress::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x56);
        assert_eq!(split_indices(va), [1, 2, 3, 4]);
    }

    #[test]
    fn zeroed_table_is_empty() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        t.set(7, PageEntryBits::new().with_present(true));
        assert!(!t.is_empty());
        t.zero();
        assert!(t.is_empty());
    }
}
