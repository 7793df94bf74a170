//! # Kernel synchronization primitives
//!
//! Spin-style locks only: nothing in here ever sleeps or yields, so every
//! primitive is usable from interrupt context.
//!
//! - [`SpinLock`]: test-and-test-and-set lock with an RAII guard.
//! - [`IrqSpinLock`]: a [`SpinLock`] that additionally masks local interrupts
//!   for as long as the guard is held, so an interrupt handler on the same
//!   core cannot re-enter the critical section and deadlock on it.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
