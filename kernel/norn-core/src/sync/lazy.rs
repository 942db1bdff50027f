//! Lazy initialization primitive for `no_std`.
//!
//! Provides [`LazyLock`], a `no_std` equivalent of `std::sync::LazyLock`
//! that initializes a value on first access using a spin-based state machine.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A value that is initialized on first access.
///
/// Thread-safe via an atomic state machine. If multiple CPUs race to
/// initialize, one wins and the others spin until the value is ready.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The atomic state machine ensures that the value is fully
// initialized before any thread can read it, and that the init closure is
// consumed exactly once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    /// Forces initialization if not already done, then returns a reference.
    fn force(&self) -> &T {
        match self.state.load(Ordering::Acquire) {
            READY => {
                // SAFETY: State is READY, so the value is fully initialized.
                return unsafe { (*self.value.get()).assume_init_ref() };
            }
            UNINIT => {
                if self
                    .state
                    .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    // We won the race.
                    // SAFETY: We are the only thread in INITIALIZING state.
                    let init = unsafe { (*self.init.get()).take().unwrap() };
                    let value = init();
                    // SAFETY: No other thread reads the value until READY.
                    unsafe {
                        (*self.value.get()).write(value);
                    }
                    self.state.store(READY, Ordering::Release);
                    // SAFETY: We just wrote the value.
                    return unsafe { (*self.value.get()).assume_init_ref() };
                }
            }
            _ => {}
        }

        // Another thread is initializing; spin until it finishes.
        while self.state.load(Ordering::Acquire) != READY {
            core::hint::spin_loop();
        }
        // SAFETY: State is READY.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        self.force()
    }
}
