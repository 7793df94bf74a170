//! # Memory Layout

/// Size of one page/frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// First address handed out in a user address space. Page 0 stays unmapped so
/// null dereferences fault.
pub const USERSPACE_BASE: u64 = 0x0000_0000_0040_0000;

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0x0000_7fff_ffff_f000;

/// Initial size of a user address space window, in pages (1 GiB).
pub const USERSPACE_DEFAULT_PAGES: u64 = (1024 * 1024 * 1024) / PAGE_SIZE;

/// Hard limit a user window may be expanded to, in pages.
pub const USERSPACE_MAX_PAGES: u64 = (LAST_USERSPACE_ADDRESS - USERSPACE_BASE) / PAGE_SIZE;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the kernel's dynamic allocation window (the first address space).
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Initial size of the kernel window, in pages (256 MiB).
pub const KERNEL_HEAP_PAGES: u64 = (256 * 1024 * 1024) / PAGE_SIZE;

/// Hard limit the kernel window may be expanded to, in pages (64 GiB).
pub const KERNEL_HEAP_MAX_PAGES: u64 = (64 * 1024 * 1024 * 1024) / PAGE_SIZE;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

const _: () = {
    assert!(USERSPACE_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_DEFAULT_PAGES <= USERSPACE_MAX_PAGES);
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(KERNEL_HEAP_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_BASE + KERNEL_HEAP_MAX_PAGES * PAGE_SIZE <= KERNEL_BASE);
};
