pub(crate) mod context;
pub(crate) mod cpu;
mod lifecycle;
mod lwp;
mod scheduler;
mod task;
mod trapframe;

pub use task::{Chan, KernelError, MlfqLevel, MlfqState, SchedMode, StrideState, TaskEntry, TaskState};
pub use trapframe::Trapframe;

pub(crate) use task::{task_chan, Task, CHAN_TICKS};

use crate::{
    file::File,
    file::Inode,
    mem::{AddressSpace, PteFlags},
    param::{KSTACKSIZE, NCPU, NOFILE, NPROC, PGSIZE},
    sync::{SpinMutex, Spinlock},
    user::UserEnv,
};
use arrayvec::ArrayString;
use core::cell::UnsafeCell;
use cpu::{hart, Cpu};
use scheduler::task_main;
use std::sync::Arc;

/// Global scheduler state, guarded by the table lock.
pub(crate) struct Shared {
    /// The MLFQ pool's standing as a single stride client.
    pub mlfq: MlfqPseudo,
    /// Sum of admitted stride shares, excluding the MLFQ residual.
    pub total_cpu: i32,
    pub nextpid: i32,
    pub nexttid: i32,
    pub initproc: Option<usize>,
}

pub(crate) struct MlfqPseudo {
    pub pass: u64,
    pub cpu_share: i32,
    /// Highest priority value handed out; new back-of-queue positions come
    /// from incrementing it.
    pub hpriority: u32,
    /// MLFQ ticks since the last priority boost.
    pub total_tick: u32,
}

/// The task table: one spinlock serializes every state transition of every
/// slot and of the global scheduler state.
pub(crate) struct Ptable {
    pub lock: Spinlock,
    slots: [UnsafeCell<Task>; NPROC],
    /// Hand-off cells, one per slot. Kept outside the slots so a switch
    /// never aliases task state.
    pub contexts: [context::Context; NPROC],
    shared: UnsafeCell<Shared>,
}

unsafe impl Sync for Ptable {}

/// The kernel core: task table, per-CPU scheduler state, clock.
pub struct Kernel {
    pub(crate) ptable: Ptable,
    pub(crate) cpus: [Cpu; NCPU],
    pub(crate) ticks_lock: Spinlock,
    pub(crate) ticks: UnsafeCell<u64>,
    root: Arc<Inode>,
}

unsafe impl Sync for Kernel {}
unsafe impl Send for Kernel {}

/// Snapshot of one live slot, taken under the table lock.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub slot: usize,
    pub state: TaskState,
    pub pid: i32,
    pub tid: i32,
    pub parent_pid: Option<i32>,
    pub master_slot: Option<usize>,
    pub sz: usize,
    pub vabase: usize,
    pub blank_regions: Vec<usize>,
    pub sched_mode: SchedMode,
    pub mlfq: MlfqState,
    pub stride: StrideState,
    pub killed: bool,
    pub open_files: usize,
    pub name: String,
    pub chan: Chan,
    /// Whether this slot shares its page table with the given other slot is
    /// answerable through `same_address_space`; the raw handle stays private.
    pub has_address_space: bool,
}

/// Snapshot of the global scheduler state.
#[derive(Copy, Clone, Debug)]
pub struct SchedStats {
    pub mlfq_pass: u64,
    pub mlfq_cpu_share: i32,
    pub mlfq_hpriority: u32,
    pub mlfq_total_tick: u32,
    pub total_cpu: i32,
    pub ticks: u64,
}

impl Kernel {
    /// Boot a kernel: empty table, then the init task.
    pub fn new() -> Arc<Kernel> {
        let kernel = Arc::new(Kernel {
            ptable: Ptable {
                lock: Spinlock::new(),
                slots: core::array::from_fn(|_| UnsafeCell::new(Task::new())),
                contexts: core::array::from_fn(|_| context::Context::new()),
                shared: UnsafeCell::new(Shared {
                    mlfq: MlfqPseudo {
                        pass: 0,
                        cpu_share: 100,
                        hpriority: 0,
                        total_tick: 0,
                    },
                    total_cpu: 0,
                    nextpid: 1,
                    nexttid: 1,
                    initproc: None,
                }),
            },
            cpus: core::array::from_fn(|_| Cpu::new()),
            ticks_lock: Spinlock::new(),
            ticks: UnsafeCell::new(0),
            root: Arc::new(Inode),
        });
        kernel.userinit();
        kernel
    }

    /// The slot must be accessed under the table lock, or be an Embryo the
    /// caller is still constructing, or be the caller's own private state.
    pub(crate) unsafe fn task(&self, slot: usize) -> &mut Task {
        &mut *self.ptable.slots[slot].get()
    }

    /// Table lock must be held.
    pub(crate) unsafe fn shared(&self) -> &mut Shared {
        &mut *self.ptable.shared.get()
    }

    /// Slot index of the task running on the caller's CPU.
    pub(crate) fn myproc(&self) -> Option<usize> {
        let h = hart()?;
        self.cpus[h.cpu].current.get()
    }

    /// Run `f` on the current task's slot. The fields the syscall layer
    /// touches through this are private to the running task, so the table
    /// lock is not required.
    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let me = self.myproc().expect("no current task");
        f(unsafe { self.task(me) })
    }

    /// Consume the entry the thread_create wrapper staged for this syscall.
    pub(crate) fn take_staged_entry(&self) -> Option<TaskEntry> {
        self.with_current(|p| p.staged_entry.take())
    }

    /// Park the init reaper until a child event, unless a zombie child is
    /// already waiting for it.
    pub(crate) fn reaper_park(&self) {
        let Some(me) = self.myproc() else { return };
        unsafe {
            self.ptable.lock.acquire();
            let mut ready = false;
            for i in 0..NPROC {
                let q = self.task(i);
                if q.state == TaskState::Zombie && q.parent == Some(me) {
                    ready = true;
                    break;
                }
            }
            if !ready {
                self.sleep(task_chan(me), &self.ptable.lock);
            }
            self.ptable.lock.release();
        }
    }

    /// Look in the table for an Unused slot. If found, mark it Embryo,
    /// assign a pid, and give it a kernel stack parked on its context.
    pub(crate) fn allocproc(&self) -> Result<usize, KernelError> {
        let slot = {
            let _guard = self.ptable.lock.lock();
            let found = (0..NPROC).find(|&i| unsafe { self.task(i).state } == TaskState::Unused);
            let Some(slot) = found else {
                return Err(KernelError::NoSlot);
            };
            let sh = unsafe { self.shared() };
            let p = unsafe { self.task(slot) };
            p.state = TaskState::Embryo;
            p.pid = sh.nextpid;
            sh.nextpid += 1;
            slot
        };

        // The Embryo slot is ours alone now; finish it without the lock.
        let p = unsafe { self.task(slot) };
        p.tid = 0;
        p.master = None;
        p.parent = None;
        p.pagetable = None;
        p.sz = 0;
        p.vabase = 0;
        p.blank_regions.clear();
        p.trapframe = Trapframe::new();
        p.chan = 0;
        p.killed = false;
        p.open_files = [const { None }; NOFILE];
        p.cwd = None;
        p.name.clear();
        p.sched_mode = SchedMode::Mlfq;
        p.mlfq = MlfqState::default();
        p.stride = StrideState::default();
        p.tmp_retval = 0;
        p.entry = None;
        p.staged_entry = None;

        // Allocate the kernel stack: a host thread parked on this slot's
        // context until its first dispatch.
        let kp = KernPtr(self as *const Kernel);
        let spawned = std::thread::Builder::new()
            .name(format!("kstack-{slot}"))
            .stack_size(KSTACKSIZE)
            .spawn(move || task_main(kp, slot));

        match spawned {
            Ok(handle) => {
                p.kstack = Some(handle);
                Ok(slot)
            }
            Err(_) => {
                let _guard = self.ptable.lock.lock();
                let p = unsafe { self.task(slot) };
                p.pid = 0;
                p.state = TaskState::Unused;
                Err(KernelError::NoMemory)
            }
        }
    }

    /// Free a slot and everything hanging from it. Table lock must be held.
    /// The kernel stack is reclaimed by halting its parked thread (a Zombie's
    /// thread has already run to completion and just needs joining).
    pub(crate) unsafe fn freeproc(&self, slot: usize) {
        let p = self.task(slot);
        if let Some(handle) = p.kstack.take() {
            if p.state != TaskState::Zombie {
                self.ptable.contexts[slot].post_halt();
            }
            handle.join().expect("kstack join");
        }
        p.pagetable = None;
        p.sz = 0;
        p.vabase = 0;
        p.blank_regions.clear();
        p.pid = 0;
        p.tid = 0;
        p.master = None;
        p.parent = None;
        p.chan = 0;
        p.killed = false;
        p.name.clear();
        p.entry = None;
        p.staged_entry = None;
        p.tmp_retval = 0;
        p.sched_mode = SchedMode::Mlfq;
        p.mlfq = MlfqState::default();
        p.stride = StrideState::default();
        p.state = TaskState::Unused;
    }

    /// Set up the first task. It loops reaping orphans reparented to it.
    fn userinit(self: &Arc<Self>) {
        let pid = self
            .spawn("init", 0, |env, _arg| loop {
                if env.wait() < 0 {
                    env.reaper_park();
                }
            })
            .expect("userinit");
        debug_assert_eq!(pid, 1);

        let _guard = self.ptable.lock.lock();
        let sh = unsafe { self.shared() };
        let slot = (0..NPROC)
            .find(|&i| unsafe { self.task(i).pid } == pid)
            .expect("userinit slot");
        sh.initproc = Some(slot);
    }

    /// Create a process running `body`. The embedder-facing analogue of the
    /// boot-time user program: one user page, console files, root cwd.
    pub fn spawn<F>(&self, name: &str, arg: u64, body: F) -> Result<i32, KernelError>
    where
        F: Fn(&mut UserEnv, u64) + Send + Sync + 'static,
    {
        let entry: TaskEntry = Arc::new(body);
        let slot = self.allocproc()?;

        let mut space = AddressSpace::new();
        space.alloc_uvm(0, PGSIZE, PteFlags::U | PteFlags::W)?;

        let p = unsafe { self.task(slot) };
        p.pagetable = Some(Arc::new(SpinMutex::new(space)));
        p.sz = PGSIZE;
        p.trapframe.epc = Arc::as_ptr(&entry) as *const () as usize;
        p.trapframe.sp = PGSIZE;
        p.trapframe.a0 = arg;
        p.entry = Some(entry);
        p.name = ArrayString::from(&name[..name.len().min(15)]).unwrap_or_default();
        p.open_files[0] = Some(File::console());
        p.open_files[1] = Some(File::console());
        p.cwd = Some(Arc::clone(&self.root));

        let pid = p.pid;
        log::debug!("spawn pid {} ({})", pid, name);

        let _guard = self.ptable.lock.lock();
        let p = unsafe { self.task(slot) };
        // Everything descends from init, which reaps spawned processes when
        // they exit. Init itself is spawned before initproc is recorded.
        p.parent = unsafe { self.shared() }.initproc;
        p.state = TaskState::Runnable;
        Ok(pid)
    }

    /// Snapshot every live slot.
    pub fn dump(&self) -> Vec<TaskInfo> {
        let _guard = self.ptable.lock.lock();
        let mut out = Vec::new();
        for slot in 0..NPROC {
            let p = unsafe { self.task(slot) };
            if p.state == TaskState::Unused {
                continue;
            }
            let parent_pid = p.parent.map(|i| unsafe { self.task(i).pid });
            out.push(TaskInfo {
                slot,
                state: p.state,
                pid: p.pid,
                tid: p.tid,
                parent_pid,
                master_slot: p.master,
                sz: p.sz,
                vabase: p.vabase,
                blank_regions: p.blank_regions.to_vec(),
                sched_mode: p.sched_mode,
                mlfq: p.mlfq,
                stride: p.stride,
                killed: p.killed,
                open_files: p.open_files.iter().filter(|f| f.is_some()).count(),
                name: p.name.to_string(),
                chan: p.chan,
                has_address_space: p.pagetable.is_some(),
            });
        }
        out
    }

    /// Whether two live slots reference the same page-table handle.
    pub fn same_address_space(&self, a: usize, b: usize) -> bool {
        let _guard = self.ptable.lock.lock();
        let (pa, pb) = unsafe { (self.task(a), self.task(b)) };
        match (&pa.pagetable, &pb.pagetable) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    pub fn stats(&self) -> SchedStats {
        let ticks = self.uptime();
        let _guard = self.ptable.lock.lock();
        let sh = unsafe { self.shared() };
        SchedStats {
            mlfq_pass: sh.mlfq.pass,
            mlfq_cpu_share: sh.mlfq.cpu_share,
            mlfq_hpriority: sh.mlfq.hpriority,
            mlfq_total_tick: sh.mlfq.total_tick,
            total_cpu: sh.total_cpu,
            ticks,
        }
    }
}

impl Drop for Kernel {
    /// Halt every parked kernel stack and join it; nothing else references
    /// the kernel by the time the last handle drops.
    fn drop(&mut self) {
        for slot in 0..NPROC {
            let p = unsafe { &mut *self.ptable.slots[slot].get() };
            if let Some(handle) = p.kstack.take() {
                if p.state != TaskState::Zombie {
                    self.ptable.contexts[slot].post_halt();
                }
                let _ = handle.join();
            }
        }
    }
}

/// Raw kernel pointer a kernel stack is parameterized with. Valid for the
/// thread's whole life: `Kernel::drop` joins every stack first.
pub(crate) struct KernPtr(pub *const Kernel);
unsafe impl Send for KernPtr {}
