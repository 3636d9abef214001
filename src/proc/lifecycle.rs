use super::{
    task::{task_chan, TaskState},
    Kernel, KernelError,
};
use crate::{
    mem::PteFlags,
    param::NPROC,
    sync::SpinMutex,
};
use log::debug;
use std::sync::Arc;

impl Kernel {
    /// Create a new process copying the caller. The child re-enters the
    /// inherited program with 0 in the return register; the caller gets the
    /// child's pid. A slave's fork clones from the master's authoritative
    /// size so the child covers every thread stack.
    pub(crate) fn fork(&self) -> Result<i32, KernelError> {
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;
        let child = self.allocproc()?;

        let (master, master_sz, pagetable, trapframe, name, entry, open_files, cwd) = unsafe {
            let _guard = self.ptable.lock.lock();
            let p = self.task(me);
            let master = p.master_or(me);
            (
                master,
                self.task(master).sz,
                p.pagetable.clone().expect("fork pagetable"),
                p.trapframe.clone(),
                p.name,
                p.entry.clone(),
                p.open_files.clone(),
                p.cwd.clone(),
            )
        };

        // Deep copy outside the table lock; the Embryo child is still ours.
        let space = pagetable.lock().copy_uvm(master_sz);

        let np = unsafe { self.task(child) };
        np.pagetable = Some(Arc::new(SpinMutex::new(space)));
        np.sz = master_sz;
        np.trapframe = trapframe;
        // The child observes 0 from fork.
        np.trapframe.a0 = 0;
        np.open_files = open_files;
        np.cwd = cwd;
        np.name = name;
        np.entry = entry;
        let pid = np.pid;

        unsafe {
            let _guard = self.ptable.lock.lock();
            let np = self.task(child);
            np.parent = Some(master);
            np.state = TaskState::Runnable;
        }
        debug!("fork: pid {} -> {}", unsafe { self.task(me).pid }, pid);
        Ok(pid)
    }

    /// Exit the current task's process. Does not return; the slot lingers as
    /// a Zombie until the parent reaps it in wait().
    ///
    /// A master first kills and collects every live slave. A slave instead
    /// flags its master killed: exit() tears the whole process down, unlike
    /// thread_exit().
    pub(crate) fn exit(&self) -> ! {
        let me = self.myproc().expect("exit");

        unsafe {
            self.ptable.lock.acquire();
            if self.shared().initproc == Some(me) {
                panic!("init exiting");
            }
            let tid = self.task(me).tid;

            if tid == 0 {
                loop {
                    let mut slavecnt = 0;
                    for slot in 0..NPROC {
                        let q = self.task(slot);
                        if q.state == TaskState::Unused || q.master != Some(me) {
                            continue;
                        }
                        if q.state == TaskState::Zombie {
                            self.cleanup_thread(slot);
                        } else {
                            slavecnt += 1;
                            q.killed = true;
                            if q.state == TaskState::Sleeping {
                                q.state = TaskState::Runnable;
                            }
                        }
                    }
                    if slavecnt == 0 {
                        break;
                    }
                    // A woken killed slave reaches thread_exit promptly and
                    // wakes us again.
                    self.sleep(task_chan(me), &self.ptable.lock);
                }
            }
            self.ptable.lock.release();
        }

        // Close everything we hold open; these fields are private to us.
        let p = unsafe { self.task(me) };
        for file in p.open_files.iter_mut() {
            *file = None;
        }
        p.cwd = None;

        unsafe {
            self.ptable.lock.acquire();
            let p = self.task(me);

            if p.tid == 0 {
                // Parent might be sleeping in wait().
                if let Some(parent) = p.parent {
                    self.wakeup1(task_chan(parent));
                }
                let share = p.stride.cpu_share;
                let sh = self.shared();
                sh.total_cpu -= share;
                sh.mlfq.cpu_share = 100 - sh.total_cpu;
            } else if let Some(master) = p.master {
                self.task(master).killed = true;
                self.wakeup1(task_chan(master));
            }

            // Pass abandoned children to init.
            let init = self.shared().initproc.expect("no initproc");
            for slot in 0..NPROC {
                let q = self.task(slot);
                if q.state != TaskState::Unused && q.parent == Some(me) {
                    q.parent = Some(init);
                    if q.state == TaskState::Zombie {
                        self.wakeup1(task_chan(init));
                    }
                }
            }

            debug!("exit: pid {} tid {}", self.task(me).pid, self.task(me).tid);
            self.task(me).state = TaskState::Zombie;
            self.sched();
        }
        unreachable!("zombie exit");
    }

    /// Wait for a child process to exit; reap it and return its pid.
    pub(crate) fn wait(&self) -> Result<i32, KernelError> {
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;

        unsafe {
            self.ptable.lock.acquire();
            loop {
                let mut havekids = false;
                for slot in 0..NPROC {
                    let q = self.task(slot);
                    if q.state == TaskState::Unused || q.parent != Some(me) {
                        continue;
                    }
                    havekids = true;
                    if q.state == TaskState::Zombie {
                        let pid = q.pid;
                        self.freeproc(slot);
                        self.ptable.lock.release();
                        return Ok(pid);
                    }
                }

                if !havekids {
                    self.ptable.lock.release();
                    return Err(KernelError::NoSuchChild);
                }
                if self.task(me).killed {
                    self.ptable.lock.release();
                    return Err(KernelError::Killed);
                }

                // Wait for a child to exit.
                self.sleep(task_chan(me), &self.ptable.lock);
            }
        }
    }

    /// Kill the process with the given pid. The victim exits at its next
    /// return to user space.
    pub fn kill(&self, pid: i32) -> Result<(), KernelError> {
        unsafe {
            self.ptable.lock.acquire();
            for slot in 0..NPROC {
                let p = self.task(slot);
                if p.state == TaskState::Unused || p.pid != pid || p.tid != 0 {
                    continue;
                }
                p.killed = true;
                if p.state == TaskState::Sleeping {
                    // Wake it from sleep() so it can notice.
                    p.state = TaskState::Runnable;
                }
                self.ptable.lock.release();
                return Ok(());
            }
            self.ptable.lock.release();
        }
        Err(KernelError::NoSuchProcess)
    }

    /// Grow or shrink the process's memory by `n` bytes, always through the
    /// master's authoritative size. Returns the old size.
    pub(crate) fn growproc(&self, n: i64) -> Result<usize, KernelError> {
        let me = self.myproc().ok_or(KernelError::NoSuchProcess)?;

        unsafe {
            self.ptable.lock.acquire();
            let p = self.task(me);
            let master = p.master_or(me);
            let pagetable = p.pagetable.clone();
            let old_size = self.task(master).sz;

            let Some(pagetable) = pagetable else {
                self.ptable.lock.release();
                return Err(KernelError::NoMemory);
            };
            let wanted = old_size as i64 + n;
            if wanted < 0 {
                self.ptable.lock.release();
                return Err(KernelError::BadArg);
            }

            let new_size = if n > 0 {
                match pagetable
                    .lock()
                    .alloc_uvm(old_size, wanted as usize, PteFlags::U | PteFlags::W)
                {
                    Ok(sz) => sz,
                    Err(e) => {
                        self.ptable.lock.release();
                        return Err(e);
                    }
                }
            } else {
                pagetable.lock().dealloc_uvm(old_size, wanted as usize)
            };

            self.task(master).sz = new_size;
            self.ptable.lock.release();
            Ok(old_size)
        }
    }

    /// Pid of the calling process's parent, 0 for init.
    pub(crate) fn getppid(&self) -> i32 {
        let Some(me) = self.myproc() else { return 0 };
        let _guard = self.ptable.lock.lock();
        unsafe {
            let p = self.task(me);
            let master = p.master_or(me);
            match self.task(master).parent {
                Some(parent) => self.task(parent).pid,
                None => 0,
            }
        }
    }
}
