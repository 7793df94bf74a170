use crate::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};
use core::fmt;

/// Number of a 4 KiB physical frame.
///
/// Frame `n` covers physical bytes `[n * 4096, (n + 1) * 4096)`. Frame 0 is the
/// null/guard frame and is never handed out by the frame allocator.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(u64);

/// Number of a 4 KiB virtual page.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn new(number: u64) -> Self {
        Self(number)
    }

    /// Frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() >> PAGE_SHIFT)
    }

    /// Frame starting exactly at `addr`, or `None` if `addr` is unaligned.
    #[inline]
    #[must_use]
    pub const fn from_start(addr: PhysicalAddress) -> Option<Self> {
        if addr.page_offset() == 0 {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, frames: u64) -> Option<Self> {
        match self.0.checked_add(frames) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn new(number: u64) -> Self {
        Self(number)
    }

    /// Page containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.as_u64() >> PAGE_SHIFT)
    }

    /// Page starting exactly at `addr`, or `None` if `addr` is unaligned.
    #[inline]
    #[must_use]
    pub const fn from_start(addr: VirtualAddress) -> Option<Self> {
        if addr.is_aligned() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, pages: u64) -> Option<Self> {
        match self.0.checked_add(pages) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame(#{}, {})", self.0, self.start_address())
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(#{}, {})", self.0, self.start_address())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
