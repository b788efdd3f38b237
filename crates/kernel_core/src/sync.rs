//! Spin lock that masks local interrupts while held.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

/// A `spin::Mutex` that saves and masks IRQs before spinning.
///
/// A holder can never be interrupted on its own core by a handler that takes
/// the same lock. Guards must be dropped before anything that can switch
/// tasks.
pub struct IrqSpinLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Masks IRQs, then acquires the lock.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let daif = hal::irq::save_and_disable();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            daif,
        }
    }

    /// Racy peek for diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for IrqSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard restoring the saved interrupt state after unlocking.
pub struct IrqSpinLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    daif: u64,
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

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before unmasking.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        hal::irq::restore(self.daif);
    }
}
