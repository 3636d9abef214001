use crate::proc::{Kernel, KernelError, CHAN_TICKS};

impl Kernel {
    /// One timer interval has elapsed: advance the clock and wake sleepers.
    /// Runs at the top of every scheduler pass, before the table lock is
    /// taken (the tick lock is always acquired first).
    pub(crate) fn clock_tick(&self) {
        unsafe {
            self.ticks_lock.acquire();
            *self.ticks.get() += 1;
            self.wakeup(CHAN_TICKS);
            self.ticks_lock.release();
        }
    }

    /// Clock ticks since boot.
    pub fn uptime(&self) -> u64 {
        unsafe {
            self.ticks_lock.acquire();
            let t = *self.ticks.get();
            self.ticks_lock.release();
            t
        }
    }

    /// Sleep for `n` ticks, polling the clock inside the sleep loop.
    /// Fails if the caller is killed while waiting.
    pub(crate) fn sleep_ticks(&self, n: i64) -> Result<(), KernelError> {
        if n < 0 {
            return Err(KernelError::BadArg);
        }
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;

        unsafe {
            self.ticks_lock.acquire();
            let t0 = *self.ticks.get();
            while *self.ticks.get() - t0 < n as u64 {
                if self.task(me).killed {
                    self.ticks_lock.release();
                    return Err(KernelError::Killed);
                }
                self.sleep(CHAN_TICKS, &self.ticks_lock);
            }
            self.ticks_lock.release();
        }
        Ok(())
    }

    /// The return-to-user check: a killed task never makes it back to user
    /// code. Runs after every syscall and every timer preemption point.
    /// A killed slave leaves through thread_exit so its master (or the exec
    /// survivor) can collect it; a killed master tears the process down.
    pub(crate) fn usertrap_check(&self) {
        let Some(me) = self.myproc() else { return };
        let (killed, tid) = {
            let _guard = self.ptable.lock.lock();
            let p = unsafe { self.task(me) };
            (p.killed, p.tid)
        };
        if killed {
            if tid == 0 {
                self.exit()
            } else {
                self.thread_exit(0)
            }
        }
    }
}
