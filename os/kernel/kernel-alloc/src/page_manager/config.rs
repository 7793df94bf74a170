use kernel_info::memory::{
    KERNEL_HEAP_BASE, KERNEL_HEAP_MAX_PAGES, KERNEL_HEAP_PAGES, USERSPACE_BASE,
    USERSPACE_DEFAULT_PAGES, USERSPACE_MAX_PAGES,
};
use kernel_memory_addresses::VirtualAddress;

/// Who owns an address space. Decides the failure policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AddressSpaceKind {
    /// Exhaustion is fatal.
    Kernel,
    /// Exhaustion is an ordinary error for the requesting process.
    User,
}

/// Shape of a new address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressSpaceConfig {
    pub kind: AddressSpaceKind,
    /// Page-aligned start of the managed window.
    pub base: VirtualAddress,
    /// Initial window size in pages.
    pub pages: u64,
    /// Upper bound for [`expand_virtual_region_to_right`](crate::PageManager::expand_virtual_region_to_right).
    pub max_pages: u64,
}

impl AddressSpaceConfig {
    /// The kernel heap window.
    #[must_use]
    pub const fn kernel() -> Self {
        Self {
            kind: AddressSpaceKind::Kernel,
            base: VirtualAddress::new(KERNEL_HEAP_BASE),
            pages: KERNEL_HEAP_PAGES,
            max_pages: KERNEL_HEAP_MAX_PAGES,
        }
    }

    /// A default user process window.
    #[must_use]
    pub const fn user() -> Self {
        Self {
            kind: AddressSpaceKind::User,
            base: VirtualAddress::new(USERSPACE_BASE),
            pages: USERSPACE_DEFAULT_PAGES,
            max_pages: USERSPACE_MAX_PAGES,
        }
    }

    #[must_use]
    pub const fn with_base(mut self, base: VirtualAddress) -> Self {
        self.base = base;
        self
    }

    /// Set the initial size; raises `max_pages` if needed.
    #[must_use]
    pub const fn with_pages(mut self, pages: u64) -> Self {
        self.pages = pages;
        if self.max_pages < pages {
            self.max_pages = pages;
        }
        self
    }

    #[must_use]
    pub const fn with_max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }
}
