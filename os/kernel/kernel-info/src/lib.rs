//! # Kernel Memory Configuration and Firmware Contract
//!
//! This crate holds the two pieces of information the memory-management core
//! needs from outside itself:
//!
//! ### Memory Map ([`memory_map`])
//! The enumerable description of physical memory handed over once at boot by
//! firmware glue:
//! * **Regions**: `(start, length, kind)` triples, see [`MemoryRegion`](memory_map::MemoryRegion)
//! * **Kinds**: usable RAM versus everything that must stay reserved (ACPI,
//!   kernel image, framebuffer, bad memory, ...)
//! * **Enumeration**: the [`MemoryMap`](memory_map::MemoryMap) trait, so any
//!   firmware-specific descriptor array can be adapted without copying
//!
//! ### Memory Layout ([`memory`])
//! Compile-time virtual layout constants: where user address spaces start and
//! how large they are by default, where the kernel's dynamic window lives and
//! how far it may grow.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  null guard (never allocated)   │
//! USERSPACE_BASE        ├─────────────────────────────────┤
//!                       │   per-process address spaces    │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤
//!                       │   kernel dynamic window         │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
pub mod memory_map;
