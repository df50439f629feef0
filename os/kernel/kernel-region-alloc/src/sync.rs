//! # Allocator lock
//!
//! The locked allocators may be entered from interrupt handlers (a page fault
//! handler allocating a frame, say), so their state sits behind an
//! interrupt-masking spin lock:
//!
//! ```text
//! lock()   : IF -> 0, spin on `held`
//! drop     : held = false, then IF restored
//! ```
//!
//! The order on release matters. If interrupts came back first, a pending
//! interrupt would fire while the lock is still held and a handler taking the
//! same lock would spin forever on its own core.
//!
//! Interrupt masking uses `pushfq`/`cli`/`sti` on bare-metal x86-64
//! (`target_os = "none"`). Hosted unit tests emulate the interrupt flag per
//! thread; other hosted builds do not touch it.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spin lock that keeps interrupts masked on the owning core while held.
pub(crate) struct RegionLock<T> {
    held: AtomicBool,
    state: UnsafeCell<T>,
}

// Safety: `state` is only reachable through a guard, and at most one guard
// exists at a time.
unsafe impl<T: Send> Sync for RegionLock<T> {}

impl<T> RegionLock<T> {
    pub(crate) const fn new(state: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            state: UnsafeCell::new(state),
        }
    }

    /// Mask interrupts, then spin until the lock is ours.
    pub(crate) fn lock(&self) -> RegionLockGuard<'_, T> {
        let irq = IrqGuard::new();
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        RegionLockGuard {
            lock: self,
            _irq: irq,
        }
    }
}

pub(crate) struct RegionLockGuard<'a, T> {
    lock: &'a RegionLock<T>,
    /// Dropped after `Drop::drop` has released the lock.
    _irq: IrqGuard,
}

impl<T> Deref for RegionLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.state.get() }
    }
}

impl<T> DerefMut for RegionLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.state.get() }
    }
}

impl<T> Drop for RegionLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        // `_irq` restores the interrupt flag once the fields drop.
    }
}

/// Masks interrupts until dropped; restores them only if they were enabled on
/// creation, so nested guards leave the outermost one in charge.
struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    #[inline]
    fn new() -> Self {
        Self {
            were_enabled: interrupts::disable(),
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            interrupts::enable();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod interrupts {
    /// RFLAGS.IF
    const INTERRUPT_FLAG: u64 = 1 << 9;

    #[inline]
    pub fn enabled() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(preserves_flags));
        }
        rflags & INTERRUPT_FLAG != 0
    }

    /// `cli` if IF is set; returns the previous IF state.
    #[inline]
    pub fn disable() -> bool {
        let was_enabled = enabled();
        if was_enabled {
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        was_enabled
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}


#[cfg(not(any(test, all(target_arch = "x86_64", target_os = "none"))))]
mod interrupts {
    #[inline]
    pub const fn disable() -> bool {
        false
    }

    #[inline]
    pub const fn enable() {}
}
