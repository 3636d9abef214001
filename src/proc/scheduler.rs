use super::{
    context::{swtch, swtch_final, HaltToken},
    cpu::{hart, set_hart, Hart},
    task::{Chan, SchedMode, TaskState},
    KernPtr, Kernel, KernelError,
};
use crate::{
    param::{MLFQ_BOOSTING_FREQUENCY, MLFQ_MIN_PORTION, NPROC, PASS_SCALE},
    sync::Spinlock,
    user::UserEnv,
};
use core::ptr;
use log::{debug, info, trace};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

impl Kernel {
    /// Per-CPU scheduler loop. Each pass enables interrupts, advances the
    /// clock, picks a runnable task (stride winner, else the MLFQ
    /// subroutine), and switches into it until it hands control back.
    pub fn scheduler(&self, cpu_id: usize) -> ! {
        loop {
            self.schedule(cpu_id);
        }
    }

    /// Run up to `passes` scheduler passes on `cpu_id`, collecting the
    /// (pid, tid) of every dispatch. Idle passes contribute nothing.
    pub fn run(&self, cpu_id: usize, passes: usize) -> Vec<(i32, i32)> {
        let mut trace = Vec::new();
        for _ in 0..passes {
            if let Some(ran) = self.schedule(cpu_id) {
                trace.push(ran);
            }
        }
        trace
    }

    /// One scheduler pass. Returns the (pid, tid) dispatched, if any.
    pub fn schedule(&self, cpu_id: usize) -> Option<(i32, i32)> {
        set_hart(Some(Hart {
            kern: self as *const Kernel,
            cpu: cpu_id,
        }));
        let c = &self.cpus[cpu_id];
        c.intr_on();

        self.clock_tick();

        unsafe {
            self.ptable.lock.acquire();

            // Stride pick: lowest pass among runnable stride tasks, with the
            // MLFQ pool standing in as one client at its own pass.
            let mut winner = None;
            let mut minpass = self.shared().mlfq.pass;
            let mut nrunnable = 0;
            for slot in 0..NPROC {
                let p = self.task(slot);
                if p.state != TaskState::Runnable {
                    continue;
                }
                nrunnable += 1;
                if p.sched_mode == SchedMode::Stride && p.stride.pass < minpass {
                    minpass = p.stride.pass;
                    winner = Some(slot);
                }
            }

            let ran = if let Some(slot) = winner {
                let ran = (self.task(slot).pid, self.task(slot).tid);
                self.dispatch(cpu_id, slot);
                // Advance the winner only after a completed dispatch, so
                // selection stays idempotent.
                let stride = self.get_stride(slot);
                self.task(slot).stride.pass += stride;
                Some(ran)
            } else {
                let ran = self.mlfq_scheduler(cpu_id);
                if nrunnable == 0 {
                    // Nothing to run anywhere: stop the pool's pass from
                    // drifting ahead of future admissions.
                    self.shared().mlfq.pass = 0;
                }
                ran
            };

            self.ptable.lock.release();
            // The driver thread is only "on" this CPU inside a pass.
            set_hart(None);
            ran
        }
    }

    /// Switch this CPU into the task at `slot` and take control back when it
    /// blocks, yields, or exits. Table lock held throughout (handed to the
    /// task and back).
    unsafe fn dispatch(&self, cpu_id: usize, slot: usize) {
        let c = &self.cpus[cpu_id];
        c.current.set(Some(slot));
        let p = self.task(slot);
        p.state = TaskState::Running;
        trace!("cpu{} runs pid {} tid {}", cpu_id, p.pid, p.tid);

        swtch(self, &c.context, &self.ptable.contexts[slot]);

        c.current.set(None);
    }

    /// The MLFQ pool's turn: boost if due, dispatch the best (level,
    /// priority) task, account its tick, then advance the pool's own pass.
    unsafe fn mlfq_scheduler(&self, cpu_id: usize) -> Option<(i32, i32)> {
        let sh = self.shared();
        if sh.mlfq.total_tick == MLFQ_BOOSTING_FREQUENCY {
            for slot in 0..NPROC {
                let p = self.task(slot);
                if p.state != TaskState::Runnable {
                    continue;
                }
                p.mlfq.level = super::MlfqLevel::L0;
                p.mlfq.priority = 0;
                p.mlfq.ticks = 0;
            }
            sh.mlfq.hpriority = 0;
            sh.mlfq.total_tick = 0;
            debug!("mlfq priority boost");
        }

        let mut chosen: Option<usize> = None;
        let mut best = (super::MlfqLevel::L2, u32::MAX);
        for slot in 0..NPROC {
            let p = self.task(slot);
            if p.state != TaskState::Runnable || p.sched_mode != SchedMode::Mlfq {
                continue;
            }
            let key = (p.mlfq.level, p.mlfq.priority);
            if chosen.is_none() || key < best {
                chosen = Some(slot);
                best = key;
            }
        }

        let mut ran = None;
        if let Some(slot) = chosen {
            ran = Some((self.task(slot).pid, self.task(slot).tid));
            self.dispatch(cpu_id, slot);

            let p = self.task(slot);
            p.mlfq.ticks += 1;
            let sh = self.shared();
            sh.mlfq.total_tick += 1;

            // Demote once the allotment is used up; otherwise a full quantum
            // sends the task to the back of its level's queue.
            match p.mlfq.level.allotment() {
                Some(allotment) if p.mlfq.ticks >= allotment => {
                    p.mlfq.level = p.mlfq.level.demote();
                    p.mlfq.ticks = 0;
                }
                _ => {
                    if p.mlfq.ticks % p.mlfq.level.quantum() == 0 {
                        sh.mlfq.hpriority += 1;
                        p.mlfq.priority = sh.mlfq.hpriority;
                    }
                }
            }
        }

        let sh = self.shared();
        sh.mlfq.pass += 100 * PASS_SCALE / (100 - sh.total_cpu) as u64;
        ran
    }

    /// Current stride of the task at `slot`: its process share divided
    /// evenly among the threads sharing the pid. Table lock must be held.
    pub(crate) unsafe fn get_stride(&self, slot: usize) -> u64 {
        let sp = self.task(slot);
        if sp.sched_mode != SchedMode::Stride {
            panic!("get_stride");
        }

        let mut nthreads = 0u64;
        for i in 0..NPROC {
            if self.task(i).pid == sp.pid {
                nthreads += 1;
            }
        }

        100 * PASS_SCALE / sp.stride.cpu_share as u64 / nthreads
    }

    /// Zero every stride pass, the MLFQ pool's included. Run on every
    /// admission change so nobody starts ahead or behind. Table lock held.
    pub(crate) unsafe fn reset_strides(&self) {
        for slot in 0..NPROC {
            let p = self.task(slot);
            if p.state == TaskState::Unused || p.sched_mode != SchedMode::Stride {
                continue;
            }
            p.stride.pass = 0;
        }
        self.shared().mlfq.pass = 0;
    }

    /// Admit the caller's process as a stride client with `share` percent of
    /// the CPU, keeping at least `MLFQ_MIN_PORTION` for the MLFQ pool. A
    /// repeated call replaces the previous share.
    pub(crate) fn set_cpu_share(&self, share: i32) -> Result<(), KernelError> {
        if !(1..=100).contains(&share) {
            return Err(KernelError::BadArg);
        }
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;

        unsafe {
            self.ptable.lock.acquire();
            let p = self.task(me);
            let pid = p.pid;
            let master = p.master_or(me);
            let m = self.task(master);
            let old = if m.sched_mode == SchedMode::Stride {
                m.stride.cpu_share
            } else {
                0
            };

            let sh = self.shared();
            if sh.total_cpu - old + share > 100 - MLFQ_MIN_PORTION {
                self.ptable.lock.release();
                return Err(KernelError::AdmissionDenied);
            }
            sh.total_cpu += share - old;
            sh.mlfq.cpu_share = 100 - sh.total_cpu;

            for slot in 0..NPROC {
                let q = self.task(slot);
                if q.state == TaskState::Unused || q.pid != pid {
                    continue;
                }
                q.sched_mode = SchedMode::Stride;
                q.stride.cpu_share = share;
            }
            self.reset_strides();
            info!("pid {} admitted with {}% cpu share", pid, share);
            self.ptable.lock.release();
        }
        Ok(())
    }

    /// Enter the scheduler. Caller must hold the table lock exactly once and
    /// have already changed the task's state. Saves and restores the CPU's
    /// saved interrupt flag, which belongs to this kernel stack rather than
    /// the CPU itself.
    pub(crate) unsafe fn sched(&self) {
        let h = hart().expect("sched");
        let c = &self.cpus[h.cpu];
        let slot = c.current.get().expect("sched no task");
        let p = self.task(slot);

        if !self.ptable.lock.holding() {
            panic!("sched ptable.lock");
        }
        if c.interrupt_disable_layers.get() != 1 {
            panic!("sched locks");
        }
        if p.state == TaskState::Running {
            panic!("sched running");
        }
        if c.intr_get() {
            panic!("sched interruptible");
        }

        if p.state == TaskState::Zombie {
            // Schedule away forever; this stack is done.
            swtch_final(&c.context);
        }

        let intena = c.previous_interrupts_enabled.get();
        let cpu = swtch(self, &self.ptable.contexts[slot], &c.context);
        self.cpus[cpu].previous_interrupts_enabled.set(intena);
    }

    /// Give up the CPU for one scheduling round.
    pub(crate) fn yield_now(&self) {
        unsafe {
            self.ptable.lock.acquire();
            let slot = self.myproc().expect("yield");
            self.task(slot).state = TaskState::Runnable;
            self.sched();
            self.ptable.lock.release();
        }
    }

    /// Atomically release `lk` and sleep on `chan`; reacquires `lk` once
    /// awakened. Holding the table lock across the state change is what
    /// keeps wakers from racing past the sleeper.
    pub(crate) unsafe fn sleep(&self, chan: Chan, lk: &Spinlock) {
        let slot = self.myproc().expect("sleep");

        let table = &self.ptable.lock;
        if !ptr::eq(lk, table) {
            table.acquire();
            lk.release();
        }

        let p = self.task(slot);
        p.chan = chan;
        p.state = TaskState::Sleeping;

        self.sched();

        self.task(slot).chan = 0;

        if !ptr::eq(lk, table) {
            table.release();
            lk.acquire();
        }
    }

    /// Wake every task sleeping on `chan`.
    pub(crate) fn wakeup(&self, chan: Chan) {
        unsafe {
            self.ptable.lock.acquire();
            self.wakeup1(chan);
            self.ptable.lock.release();
        }
    }

    /// Table lock must be held.
    pub(crate) unsafe fn wakeup1(&self, chan: Chan) {
        for slot in 0..NPROC {
            let p = self.task(slot);
            if p.state == TaskState::Sleeping && p.chan == chan {
                p.state = TaskState::Runnable;
            }
        }
    }
}

/// Body of a kernel stack: park until first dispatched, then drop into the
/// task's user code via `forkret`. Halting unwinds back here quietly; a
/// panicking task body hands control back to the scheduler before re-raising.
pub(crate) fn task_main(kp: KernPtr, slot: usize) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let kern = unsafe { &*kp.0 };
        let cpu = kern.ptable.contexts[slot].park();
        set_hart(Some(Hart { kern: kp.0, cpu }));
        forkret(kern, slot);
    }));

    if let Err(payload) = result {
        if payload.downcast_ref::<HaltToken>().is_some() {
            return;
        }
        if let Some(h) = hart() {
            let kern = unsafe { h.kernel() };
            kern.cpus[h.cpu].context.post(h.cpu);
        }
        resume_unwind(payload);
    }
}

/// A task's very first scheduling switches here. Release the table lock the
/// scheduler handed us and return to user space. A slave finds its argument
/// where thread creation pushed it, just above the fake return address.
fn forkret(kern: &Kernel, slot: usize) {
    let (entry, tid, sp, pagetable, a0) = unsafe {
        let p = kern.task(slot);
        (
            p.entry.clone(),
            p.tid,
            p.trapframe.sp,
            p.pagetable.clone(),
            p.trapframe.a0,
        )
    };

    unsafe {
        kern.ptable.lock.release();
    }

    let arg = if tid != 0 {
        pagetable
            .expect("forkret pagetable")
            .lock()
            .read_word(sp + 8)
            .expect("forkret arg")
    } else {
        a0
    };

    let mut env = UserEnv::new(kern);
    if let Some(entry) = entry {
        entry(&mut env, arg);
    }

    // User code fell off the end of its body.
    if tid == 0 {
        kern.exit()
    } else {
        kern.thread_exit(0)
    }
}
