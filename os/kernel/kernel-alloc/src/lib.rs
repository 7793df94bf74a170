//! # Kernel Memory Management Core
//!
//! Physical frame allocation, per-address-space virtual range bookkeeping,
//! and the façade that couples the two to architecture page tables.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              PageManager (one per address space)    │
//! │    • Allocation objects (Standby / InUse)           │
//! │    • Commit + map, rollback on failure              │
//! │    • Permission queries for user buffers            │
//! └───────┬──────────────────────────────┬──────────────┘
//!         │                              │
//! ┌───────▼──────────────────┐   ┌───────▼──────────────┐
//! │  AddressSpaceAllocator   │   │  PageTableAdapter    │
//! │  • free runs by size     │   │  (kernel-vmem)       │
//! │  • live ranges by start  │   └───────┬──────────────┘
//! │  • deferred compaction   │           │ table frames
//! └──────────────────────────┘   ┌───────▼──────────────┐
//!                                │ PhysicalFrameAllocator│
//!                                │  • one bitmap, system │
//!                                │    wide, IRQ-safe     │
//!                                └──────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//!
//! One instance for the whole system, seeded from the firmware memory map.
//! Frame 0 is never handed out. Before the heap exists, the
//! [`BootFrameAllocator`] serves page-table frames; it is retired into a
//! [`BootHandoff`] that the bitmap allocator adopts.
//!
//! ### Address Space Allocator ([`vspace`])
//!
//! Pure bookkeeping over one virtual window: which pages are free, reserved
//! or used. No frames, no page tables.
//!
//! ### Page Manager ([`page_manager`])
//!
//! One per address space. The kernel's own address space is simply the first
//! instance created, with [`AddressSpaceKind::Kernel`]; exhaustion there is
//! fatal, while in user address spaces it is an ordinary error.
//!
//! ## Errors
//!
//! Everything recoverable is a [`MemoryError`]. Unrecoverable invariant
//! violations go through [`fatal!`], which logs and panics.
//!
//! ## Features
//!
//! * `strict-free`: double frees and double unreserves are reported as
//!   [`MemoryError::InvalidRange`] instead of being logged and ignored.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::{AddressSpaceConfig, PhysicalFrameAllocator};
//! use kernel_info::memory_map::{MemoryRegion, MemoryRegionKind};
//!
//! let map = [MemoryRegion::new(0, 16 << 20, MemoryRegionKind::Usable)];
//! let frames = PhysicalFrameAllocator::initialize(&map, 16 << 20);
//! let frame = frames.allocate_frame().unwrap();
//! assert_ne!(frame.number(), 0);
//! frames.free_frames(frame, 1).unwrap();
//!
//! let config = AddressSpaceConfig::user().with_pages(16);
//! assert_eq!(config.pages, 16);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod bootstrap;
mod error;
pub mod frame_alloc;
pub mod page_manager;
pub mod phys_mapper;
pub mod vspace;

pub use crate::bootstrap::{BootFrameAllocator, BootHandoff};
pub use crate::error::MemoryError;
pub use crate::frame_alloc::{FrameStats, PhysicalFrameAllocator};
pub use crate::page_manager::{
    AddressSpaceConfig, AddressSpaceKind, AddressSpaceUsage, AllocationObject, ObjectState,
    PageManager,
};
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::vspace::{AddressSpaceAllocator, RangeKind, VirtualSpaceStats};
