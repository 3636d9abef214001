use crate::{
    proc::{Kernel, TaskEntry},
    syscall::{syscall, Syscall},
};
use std::sync::Arc;

/// The user-space side of a task: thin syscall wrappers over the trapframe,
/// plus the return-to-user kill check after every call. Task bodies receive
/// one of these; it is only ever constructed by the first-dispatch
/// trampoline.
pub struct UserEnv {
    kern: *const Kernel,
}

impl UserEnv {
    pub(crate) fn new(kern: &Kernel) -> UserEnv {
        UserEnv {
            kern: kern as *const Kernel,
        }
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        // The kernel joins every task thread before it is dropped.
        unsafe { &*self.kern }
    }

    fn syscall(&mut self, call: Syscall, a0: u64, a1: u64, a2: u64) -> i64 {
        let kern = self.kernel();
        kern.with_current(|p| {
            p.trapframe.a0 = a0;
            p.trapframe.a1 = a1;
            p.trapframe.a2 = a2;
            p.trapframe.a7 = usize::from(call) as u64;
        });
        syscall(kern);
        let ret = kern.with_current(|p| p.trapframe.a0) as i64;
        kern.usertrap_check();
        ret
    }

    /// Create a child process. Returns the child's pid; the child re-enters
    /// the program with 0 in the return register.
    pub fn fork(&mut self) -> i64 {
        self.syscall(Syscall::Fork, 0, 0, 0)
    }

    /// Terminate the calling process.
    pub fn exit(&mut self) -> ! {
        self.syscall(Syscall::Exit, 0, 0, 0);
        unreachable!("exit returned")
    }

    /// Reap one exited child; -1 when there is nothing to wait for.
    pub fn wait(&mut self) -> i64 {
        self.syscall(Syscall::Wait, 0, 0, 0)
    }

    pub fn kill(&mut self, pid: i32) -> i64 {
        self.syscall(Syscall::Kill, pid as u64, 0, 0)
    }

    pub fn getpid(&mut self) -> i64 {
        self.syscall(Syscall::Getpid, 0, 0, 0)
    }

    pub fn getppid(&mut self) -> i64 {
        self.syscall(Syscall::Getppid, 0, 0, 0)
    }

    /// Thread id: 0 on the master.
    pub fn gettid(&mut self) -> i64 {
        self.syscall(Syscall::Gettid, 0, 0, 0)
    }

    /// Grow the process by `n` bytes; returns the old size.
    pub fn sbrk(&mut self, n: i64) -> i64 {
        self.syscall(Syscall::Sbrk, n as u64, 0, 0)
    }

    /// Sleep for `n` clock ticks; -1 if killed while sleeping.
    pub fn sleep(&mut self, n: i64) -> i64 {
        self.syscall(Syscall::Sleep, n as u64, 0, 0)
    }

    pub fn uptime(&mut self) -> i64 {
        self.syscall(Syscall::Uptime, 0, 0, 0)
    }

    pub fn yield_now(&mut self) -> i64 {
        self.syscall(Syscall::Yield, 0, 0, 0)
    }

    /// Current MLFQ level, 0 through 2.
    pub fn getlev(&mut self) -> i64 {
        self.syscall(Syscall::Getlev, 0, 0, 0)
    }

    /// Reserve `pct` percent of the CPU for this process.
    pub fn set_cpu_share(&mut self, pct: i32) -> i64 {
        self.syscall(Syscall::SetCpuShare, pct as u64, 0, 0)
    }

    /// One quantum of computation, ended by the timer: the preemption point
    /// a CPU-bound body passes through once per tick.
    pub fn tick(&mut self) {
        self.yield_now();
    }

    /// Create a thread running `body` with `arg`; the new tid is written to
    /// user memory at `out_tid`. Returns 0, or -1 on failure.
    pub fn thread_create<F>(&mut self, out_tid: usize, arg: u64, body: F) -> i64
    where
        F: Fn(&mut UserEnv, u64) + Send + Sync + 'static,
    {
        let entry: TaskEntry = Arc::new(body);
        let epc = Arc::as_ptr(&entry) as *const () as usize;
        self.kernel().with_current(|p| {
            p.staged_entry = Some(entry);
        });
        self.syscall(Syscall::ThreadCreate, out_tid as u64, epc as u64, arg)
    }

    /// Terminate the calling thread, handing `retval` to a future join.
    pub fn thread_exit(&mut self, retval: u64) -> ! {
        self.syscall(Syscall::ThreadExit, retval, 0, 0);
        unreachable!("thread_exit returned")
    }

    /// Join the thread with `tid`; its exit value is written to user memory
    /// at `out_retval`. Master only.
    pub fn thread_join(&mut self, tid: i32, out_retval: usize) -> i64 {
        self.syscall(Syscall::ThreadJoin, tid as u64, out_retval as u64, 0)
    }

    /// Read a word of this process's user memory.
    pub fn read_word(&mut self, va: usize) -> Option<u64> {
        self.kernel()
            .with_current(|p| p.pagetable.as_ref().map(|pt| pt.lock().read_word(va)))
            .and_then(Result::ok)
    }

    /// Write a word of this process's user memory.
    pub fn write_word(&mut self, va: usize, value: u64) -> bool {
        self.kernel()
            .with_current(|p| {
                p.pagetable
                    .as_ref()
                    .map(|pt| pt.lock().write_word(va, value))
            })
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Exec coordination, first half: park and kill every other task of
    /// this process.
    pub fn kill_except(&mut self) {
        self.kernel().kill_except();
        self.kernel().usertrap_check();
    }

    /// Exec coordination, second half: assume the process identity, release
    /// the parked peers, and collect them.
    pub fn wakeup_except(&mut self) {
        self.kernel().wakeup_except();
        self.kernel().usertrap_check();
    }

    /// Park until a child event; used by the init reaper between waits.
    pub(crate) fn reaper_park(&mut self) {
        self.kernel().reaper_park();
    }
}
