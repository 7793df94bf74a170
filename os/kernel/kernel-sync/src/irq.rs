//! Interrupt masking and the interrupt-safe spin lock.
//!
//! On bare-metal x86-64 (`target_os = "none"`) the guard uses `cli`/`sti` and
//! `pushfq/pop`. On hosted targets there are no interrupts to mask and the
//! guard degenerates to a no-op, which keeps every user of [`IrqSpinLock`]
//! testable with the ordinary `cargo test` harness.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// `IF` bit in `RFLAGS`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// Whether local interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        rflags() & RFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

#[inline]
fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    cli_stop_interrupts();
}

#[inline]
fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    sti_enable_interrupts();
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, so guards nest correctly.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

/// A [`SpinLock`] that keeps local interrupts masked while held.
///
/// Use it for state that interrupt handlers may touch. Acquisition order is
/// mask-then-lock; release is unlock-then-restore.
///
/// ```
/// use kernel_sync::IrqSpinLock;
///
/// let bitmap = IrqSpinLock::new([0u64; 4]);
/// bitmap.lock()[0] |= 1;
/// assert_eq!(bitmap.with_lock(|b| b[0]), 1);
/// ```
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.inner.lock();
        IrqSpinLockGuard {
            guard,
            _irq: irq,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        // On failure the IrqGuard drops here and restores the previous state.
        let guard = self.inner.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Guard of an [`IrqSpinLock`].
///
/// Field order matters: the spin lock is released before interrupts are
/// restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
