//! Interrupt-safe spin lock.
//!
//! Disables interrupts before acquiring the inner spinlock and restores the
//! previous interrupt state on release. This prevents deadlocks when a lock
//! is shared between interrupt handlers and normal kernel code, and it is
//! the discipline both frame allocators require.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Saves RFLAGS and disables interrupts, returning the saved flags.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: pushfq/pop only reads RFLAGS; cli masks interrupts, which is
    // the point of this lock.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem, preserves_flags),
        );
    }
    flags
}

/// Restores the interrupt-enable state saved by [`save_flags_and_cli`].
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn restore_flags(flags: u64) {
    // RFLAGS.IF is bit 9.
    if flags & (1 << 9) != 0 {
        // SAFETY: Re-enabling interrupts restores the caller's prior state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
}

/// Host fallback: there are no interrupts to mask.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn save_flags_and_cli() -> u64 {
    0
}

/// Host fallback: nothing to restore.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn restore_flags(_flags: u64) {}

/// A spin lock that disables interrupts while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Same reasoning as SpinLock; atomic ops ensure exclusive access.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first. The caller's interrupt
    /// state is restored when the guard is dropped.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved_flags = save_flags_and_cli();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    saved_flags,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                saved_flags,
            })
        } else {
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard for [`IrqSpinLock`]. Restores the saved interrupt state on drop.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u64,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let lock = IrqSpinLock::new(7);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn try_lock_contended() {
        let lock = IrqSpinLock::new(());
        let _held = lock.lock();
        assert!(lock.try_lock().is_none());
    }
}
