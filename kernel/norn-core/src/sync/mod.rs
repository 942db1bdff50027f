//! Synchronization primitives.
//!
//! Norn has no kernel preemption, so all mutual exclusion is between CPUs:
//! [`SpinLock`] for state never touched from interrupt context,
//! [`IrqSpinLock`] for state that is, and [`LazyLock`] for
//! initialize-once statics.

mod irq_spinlock;
mod lazy;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
