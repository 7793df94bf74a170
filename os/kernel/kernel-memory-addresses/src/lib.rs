//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB page/frame numbers used
//! by the memory-management core.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A raw 64-bit physical address (RAM or MMIO). |
//! | [`VirtualAddress`] | A raw 64-bit virtual (page-table translated) address. |
//! | [`PhysicalFrame`] | The number of a 4 KiB physical frame (`address >> 12`). |
//! | [`VirtualPage`] | The number of a 4 KiB virtual page (`address >> 12`). |
//!
//! Frame and page numbers are what the allocators index by; addresses are what
//! callers and page tables speak. Converting between the two is explicit:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0000_0012_3456);
//! let frame = PhysicalFrame::containing(pa);
//! assert_eq!(frame.number(), 0x123);
//! assert_eq!(frame.start_address().as_u64(), 0x0012_3000);
//!
//! let va = VirtualAddress::new(0x4000);
//! let page = VirtualPage::from_start(va).unwrap();
//! assert_eq!(page.number(), 4);
//! ```
//!
//! ## Design Notes
//!
//! - All types are `#[repr(transparent)]`, `Copy`, `Ord` and `Hash`, so they can
//!   key ordered maps directly.
//! - Only 4 KiB granularity exists here; huge pages are not part of the
//!   allocation model.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod frame;
mod physical_address;
mod virtual_address;

pub use crate::frame::{PhysicalFrame, VirtualPage};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Size of one frame / page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Returns `true` if `value` is a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Number of whole pages needed to hold `bytes` (rounds up).
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Byte length of `pages` pages, or `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_pages_to_bytes(pages: u64) -> Option<u64> {
    pages.checked_mul(PAGE_SIZE)
}
