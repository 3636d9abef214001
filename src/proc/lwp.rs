use super::{
    task::{task_chan, SchedMode, TaskEntry, TaskState},
    Kernel, KernelError,
};
use crate::param::{NPROC, PGSIZE, THREAD_SENTINEL};
use crate::mem::PteFlags;
use log::debug;
use std::sync::Arc;

impl Kernel {
    /// Create a thread in the caller's process, running `entry` with `arg`.
    /// The new thread shares the address space and file table; it gets a
    /// fresh guard+stack page pair, reusing a region a joined thread left
    /// behind when one exists. Returns the new tid.
    pub(crate) fn thread_create(&self, entry: TaskEntry, arg: u64) -> Result<i32, KernelError> {
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;
        let nt = self.allocproc()?;

        unsafe {
            self.ptable.lock.acquire();

            // Threads share their process's pid; give back the one the
            // allocator just consumed.
            let sh = self.shared();
            sh.nextpid -= 1;
            let tid = sh.nexttid;
            sh.nexttid += 1;

            let master = self.task(me).master_or(me);
            let m = self.task(master);
            let pagetable = m.pagetable.clone().expect("thread_create pagetable");

            // A region a joined thread left behind is reused before the
            // address space grows.
            let (vabase, reused) = match m.blank_regions.pop() {
                Some(va) => (va, true),
                None => {
                    let va = m.sz;
                    m.sz += 2 * PGSIZE;
                    (va, false)
                }
            };

            // Two pages: the lower is an inaccessible guard, the upper the
            // user stack.
            let mapped = {
                let mut space = pagetable.lock();
                space
                    .alloc_uvm(vabase, vabase + 2 * PGSIZE, PteFlags::U | PteFlags::W)
                    .map(|_| space.uvm_clear(vabase))
            };
            if mapped.is_err() {
                let m = self.task(master);
                if reused {
                    m.blank_regions.push(vabase);
                } else {
                    m.sz -= 2 * PGSIZE;
                }
                self.freeproc(nt);
                self.ptable.lock.release();
                return Err(KernelError::NoMemory);
            }

            let m = self.task(master);
            let trapframe = m.trapframe.clone();
            let sched_mode = m.sched_mode;
            let cpu_share = m.stride.cpu_share;
            let open_files = m.open_files.clone();
            let cwd = m.cwd.clone();
            let name = m.name;
            let master_pid = m.pid;

            let np = self.task(nt);
            np.master = Some(master);
            np.pid = master_pid;
            np.tid = tid;
            np.trapframe = trapframe;
            np.sched_mode = sched_mode;
            if sched_mode == SchedMode::Stride {
                np.stride.cpu_share = cpu_share;
                self.reset_strides();
            }
            let np = self.task(nt);
            np.open_files = open_files;
            np.cwd = cwd;
            np.name = name;
            np.pagetable = Some(Arc::clone(&pagetable));
            np.vabase = vabase;
            np.sz = vabase + 2 * PGSIZE;

            // Argument, then the fake return address the entry never uses.
            let mut sp = vabase + 2 * PGSIZE;
            sp -= 8;
            let mut space = pagetable.lock();
            space.write_word(sp, arg).expect("thread_create stack");
            sp -= 8;
            space
                .write_word(sp, THREAD_SENTINEL)
                .expect("thread_create stack");
            drop(space);

            let np = self.task(nt);
            np.trapframe.epc = Arc::as_ptr(&entry) as *const () as usize;
            np.trapframe.sp = sp;
            np.entry = Some(entry);
            np.state = TaskState::Runnable;

            debug!("thread_create: pid {} tid {}", master_pid, tid);
            self.ptable.lock.release();
            Ok(tid)
        }
    }

    /// Terminate the calling thread, leaving `retval` for the master's
    /// thread_join. Does not return.
    pub(crate) fn thread_exit(&self, retval: u64) -> ! {
        let me = self.myproc().expect("thread_exit");

        let p = unsafe { self.task(me) };
        for file in p.open_files.iter_mut() {
            *file = None;
        }
        p.cwd = None;

        unsafe {
            self.ptable.lock.acquire();
            let p = self.task(me);
            p.tmp_retval = retval;

            // Master might be sleeping in thread_join().
            if let Some(master) = p.master {
                self.wakeup1(task_chan(master));
            }

            debug!("thread_exit: pid {} tid {}", p.pid, p.tid);
            p.state = TaskState::Zombie;
            self.sched();
        }
        unreachable!("zombie thread_exit");
    }

    /// Wait for the thread with `tid` to exit and reclaim it, returning the
    /// value it passed to thread_exit. Only the thread's own master may join.
    pub(crate) fn thread_join(&self, tid: i32) -> Result<u64, KernelError> {
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;

        unsafe {
            self.ptable.lock.acquire();
            if self.task(me).master.is_some() {
                self.ptable.lock.release();
                return Err(KernelError::NotMaster);
            }

            loop {
                for slot in 0..NPROC {
                    let q = self.task(slot);
                    if q.state == TaskState::Unused || q.tid != tid {
                        continue;
                    }
                    if q.master != Some(me) {
                        self.ptable.lock.release();
                        return Err(KernelError::NotMaster);
                    }
                    if q.state == TaskState::Zombie {
                        let retval = q.tmp_retval;
                        self.cleanup_thread(slot);
                        self.ptable.lock.release();
                        return Ok(retval);
                    }
                    break;
                }

                if self.task(me).killed {
                    self.ptable.lock.release();
                    return Err(KernelError::Killed);
                }

                // Wait for the slave to exit.
                self.sleep(task_chan(me), &self.ptable.lock);
            }
        }
    }

    /// Reclaim an exited thread: free its kernel stack, hand its stack
    /// region back to the master for reuse, and unmap the two pages. The
    /// shared address space itself stays alive for the other threads.
    /// Table lock must be held.
    pub(crate) unsafe fn cleanup_thread(&self, slot: usize) {
        let q = self.task(slot);
        let master = q.master.expect("cleanup_thread");
        let vabase = q.vabase;
        let sz = q.sz;

        self.task(master).blank_regions.push(vabase);
        if let Some(pagetable) = &self.task(slot).pagetable {
            pagetable.lock().dealloc_uvm(sz, vabase);
        }
        self.freeproc(slot);
    }

    /// First half of exec coordination: park every other task of the
    /// caller's process, killed, un-schedulable until the coordinated wake.
    pub(crate) fn kill_except(&self) {
        let Some(me) = self.myproc() else { return };

        unsafe {
            self.ptable.lock.acquire();
            if self.task(me).killed {
                self.ptable.lock.release();
                return;
            }
            let pid = self.task(me).pid;

            for slot in 0..NPROC {
                if slot == me {
                    continue;
                }
                let q = self.task(slot);
                if q.state == TaskState::Unused || q.pid != pid {
                    continue;
                }
                q.killed = true;
                q.chan = 0;
                q.state = TaskState::Sleeping;
            }
            self.ptable.lock.release();
        }
    }

    /// Second half of exec coordination: the caller inherits the process
    /// identity, the parked peers are released to run their exits, peers
    /// that had a parent are handed to the caller, and the caller collects
    /// them.
    pub(crate) fn wakeup_except(&self) {
        let Some(me) = self.myproc() else { return };

        let havekids = unsafe {
            self.ptable.lock.acquire();
            let pid = self.task(me).pid;

            // Survivor becomes the master: the old master's parent, size,
            // and recycled regions move over.
            if let Some(old_master) = self.task(me).master.take() {
                let (parent, sz, blanks) = {
                    let m = self.task(old_master);
                    (m.parent, m.sz, core::mem::take(&mut m.blank_regions))
                };
                let p = self.task(me);
                p.parent = parent;
                p.tid = 0;
                p.vabase = 0;
                p.sz = sz;
                p.blank_regions = blanks;
            }

            let mut havekids = false;
            for slot in 0..NPROC {
                if slot == me {
                    continue;
                }
                let q = self.task(slot);
                if q.state == TaskState::Unused || q.pid != pid {
                    continue;
                }
                q.state = TaskState::Runnable;
                // The caller inherits the process, so it collects the peers
                // that anyone was going to wait for.
                if q.parent.is_some() {
                    q.parent = Some(me);
                    havekids = true;
                }
            }
            self.ptable.lock.release();
            havekids
        };

        if havekids {
            let _ = self.wait();
        }
    }
}
