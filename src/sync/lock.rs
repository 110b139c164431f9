//! Kernel spin lock that masks interrupts and disables dispatch.
//!
//! Holding an [`IrqLock`] is a critical section: the timer interrupt cannot
//! run and `schedule()` must not be called. Releasing the last such lock with
//! a dispatch request pending reschedules, which makes every unlock a
//! potential preemption point.

use crate::arch::IntrFlags;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

/// Per-CPU operations a lock needs from the kernel instance.
pub trait DispatchControl {
    /// Mask interrupts and return the previous state.
    fn irq_save(&self) -> IntrFlags;
    /// Restore a state returned by [`DispatchControl::irq_save`].
    fn irq_restore(&self, flags: IntrFlags);
    /// Increment the dispatch-disable nesting count.
    fn disable_dispatch(&self);
    /// Decrement the nesting count; reschedules when it drops to zero and a
    /// dispatch request is pending outside interrupt context.
    fn enable_dispatch(&self);
}

/// A spin lock whose guard keeps dispatch disabled and interrupts masked.
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock on behalf of `cpu`.
    pub fn lock<'a>(&'a self, cpu: &'a dyn DispatchControl) -> IrqLockGuard<'a, T> {
        cpu.disable_dispatch();
        let flags = cpu.irq_save();
        // One CPU: a held lock at this point can only be our own.
        debug_assert!(!self.inner.is_locked(), "recursive IrqLock acquisition");
        IrqLockGuard {
            lock: self,
            guard: ManuallyDrop::new(self.inner.lock()),
            cpu,
            flags,
        }
    }

    /// Whether some flow currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Access the value through exclusive ownership of the lock.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for IrqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard returned by [`IrqLock::lock`].
pub struct IrqLockGuard<'a, T> {
    lock: &'a IrqLock<T>,
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    cpu: &'a dyn DispatchControl,
    flags: IntrFlags,
}

impl<'a, T> IrqLockGuard<'a, T> {
    /// Release the lock and return it so the caller can reacquire it later.
    pub fn unlock(self) -> &'a IrqLock<T> {
        let lock = self.lock;
        drop(self);
        lock
    }
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.cpu.irq_restore(self.flags);
        self.cpu.enable_dispatch();
    }
}
