use super::cpu::{hart, set_hart, Hart};
use crate::proc::Kernel;
use std::panic::resume_unwind;
use std::sync::{Condvar, Mutex};

/// What a parked kernel stack is told when control next reaches it.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Resume {
    /// Nobody has handed control here yet.
    Parked,
    /// Run on the given CPU.
    Run { cpu: usize },
    /// The stack is being reclaimed; unwind and terminate.
    Halt,
}

/// One side of a kernel stack switch.
///
/// Every task slot and every CPU scheduler owns one. `swtch` saves into one
/// context and restores from another by signalling the target thread and
/// parking the caller; at most one kernel stack per CPU is ever runnable, so
/// single-CPU runs are fully deterministic.
pub(crate) struct Context {
    inner: Mutex<Resume>,
    moved: Condvar,
}

/// Unwind payload delivered to a halted kernel stack. The task trampoline
/// swallows it; anything else propagates.
pub(crate) struct HaltToken;

impl Context {
    pub fn new() -> Context {
        Context {
            inner: Mutex::new(Resume::Parked),
            moved: Condvar::new(),
        }
    }

    /// Hand control to the thread parked on this context.
    pub fn post(&self, cpu: usize) {
        let mut state = self.inner.lock().unwrap();
        debug_assert!(*state == Resume::Parked);
        *state = Resume::Run { cpu };
        self.moved.notify_one();
    }

    /// Tell the thread parked on this context to terminate.
    pub fn post_halt(&self) {
        let mut state = self.inner.lock().unwrap();
        *state = Resume::Halt;
        self.moved.notify_one();
    }

    /// Block until control is handed here; returns the CPU to resume on.
    pub fn park(&self) -> usize {
        let mut state = self.inner.lock().unwrap();
        loop {
            match *state {
                Resume::Parked => state = self.moved.wait(state).unwrap(),
                Resume::Run { cpu } => {
                    *state = Resume::Parked;
                    return cpu;
                }
                Resume::Halt => {
                    *state = Resume::Parked;
                    drop(state);
                    resume_unwind(Box::new(HaltToken));
                }
            }
        }
    }
}

/// Switch kernel stacks: wake whoever is parked on `restore`, park on `save`.
/// The table lock is handed across this call per the scheduler protocol; the
/// resumed side is responsible for releasing it.
pub(crate) unsafe fn swtch(kern: &Kernel, save: &Context, restore: &Context) -> usize {
    let h = hart().expect("swtch outside any cpu");
    restore.post(h.cpu);
    let cpu = save.park();
    set_hart(Some(Hart {
        kern: kern as *const Kernel,
        cpu,
    }));
    cpu
}

/// Final departure of an exiting task: wake the scheduler and unwind this
/// stack without ever parking again.
pub(crate) unsafe fn swtch_final(restore: &Context) -> ! {
    let h = hart().expect("swtch outside any cpu");
    restore.post(h.cpu);
    resume_unwind(Box::new(HaltToken));
}
