use crate::proc::cpu::{cpuid, pop_off, push_off};
use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

const NO_CPU: isize = isize::MIN;

/// A spinning lock with interrupt-depth bookkeeping.
///
/// The raw `acquire`/`release` pair exists alongside the RAII guard because
/// the table lock is handed off across context switches: the thread that
/// acquires is not always the thread that releases. Guards are for the
/// ordinary sections that never cross a switch.
pub struct Spinlock {
    locked: AtomicBool,
    /// CPU the current owner was on when it acquired, for `holding`.
    cpu: AtomicIsize,
}

impl Spinlock {
    pub const fn new() -> Spinlock {
        Spinlock {
            locked: AtomicBool::new(false),
            cpu: AtomicIsize::new(NO_CPU),
        }
    }

    /// Acquire without a guard. The caller (or whoever the lock is handed
    /// to) must call `release`.
    pub unsafe fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("acquire");
        }

        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        self.cpu
            .store(cpuid().map_or(NO_CPU, |id| id as isize), Ordering::Relaxed);
    }

    pub unsafe fn release(&self) {
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    pub fn lock(&self) -> SpinlockGuard<'_> {
        unsafe {
            self.acquire();
        }
        SpinlockGuard { lock: self }
    }

    /// Whether this lock is held by the caller's CPU.
    pub fn holding(&self) -> bool {
        if !self.locked.load(Ordering::Relaxed) {
            return false;
        }
        match cpuid() {
            Some(id) => self.cpu.load(Ordering::Relaxed) == id as isize,
            // Threads outside any CPU cannot be distinguished; trust the flag.
            None => self.cpu.load(Ordering::Relaxed) == NO_CPU,
        }
    }
}

impl Default for Spinlock {
    fn default() -> Spinlock {
        Spinlock::new()
    }
}

pub struct SpinlockGuard<'l> {
    pub lock: &'l Spinlock,
}
impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.release() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycles() {
        let lock = Spinlock::new();
        assert!(!lock.holding());
        unsafe {
            lock.acquire();
            assert!(lock.holding());
            lock.release();
        }
        assert!(!lock.holding());
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = Spinlock::new();
        {
            let _guard = lock.lock();
            assert!(lock.holding());
        }
        assert!(!lock.holding());
    }

    #[test]
    fn handoff_release_from_other_thread() {
        use std::sync::Arc;

        let lock = Arc::new(Spinlock::new());
        unsafe {
            lock.acquire();
        }
        let other = Arc::clone(&lock);
        std::thread::spawn(move || unsafe { other.release() })
            .join()
            .unwrap();
        // Reacquirable after the handed-off release.
        let _guard = lock.lock();
    }
}
