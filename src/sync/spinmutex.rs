use super::spinlock::Spinlock;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

/// A value guarded by a `Spinlock`. Used for state that never crosses a
/// context switch while locked, e.g. an address space.
pub struct SpinMutex<T> {
    lock: Spinlock,
    inner: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> SpinMutex<T> {
        SpinMutex {
            lock: Spinlock::new(),
            inner: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        unsafe {
            self.lock.acquire();
        }
        SpinMutexGuard { mutex: self }
    }
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

pub struct SpinMutexGuard<'m, T> {
    mutex: &'m SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.inner.get() }
    }
}
impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.inner.get() }
    }
}
impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.lock.release() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_mutation() {
        let m = SpinMutex::new(7usize);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 8);
    }
}
