use crate::{
    file::{File, Inode},
    mem::Pagetable,
    param::{MLFQ_0_ALLOTMENT, MLFQ_0_QUANTUM, MLFQ_1_ALLOTMENT, MLFQ_1_QUANTUM, MLFQ_2_QUANTUM, NOFILE, NPROC},
    proc::trapframe::Trapframe,
    user::UserEnv,
};
use arrayvec::{ArrayString, ArrayVec};
use std::{sync::Arc, thread::JoinHandle};

/// A sleep wait-channel: an opaque nonzero identity shared between sleepers
/// and their wakers.
pub type Chan = usize;

/// Channel the clock tick counter is slept on.
pub(crate) const CHAN_TICKS: Chan = 1;

/// Channel identifying one task slot, used for wait/join/exit rendezvous.
pub(crate) fn task_chan(slot: usize) -> Chan {
    0x1000 + slot
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Unused,
    /// Mid-allocation: visible to the allocator, invisible to the scheduler.
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SchedMode {
    #[default]
    Mlfq,
    Stride,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MlfqLevel {
    #[default]
    L0,
    L1,
    L2,
}

impl MlfqLevel {
    pub fn quantum(self) -> u32 {
        match self {
            MlfqLevel::L0 => MLFQ_0_QUANTUM,
            MlfqLevel::L1 => MLFQ_1_QUANTUM,
            MlfqLevel::L2 => MLFQ_2_QUANTUM,
        }
    }

    /// Ticks allowed at this level before demotion; the bottom level never
    /// demotes.
    pub fn allotment(self) -> Option<u32> {
        match self {
            MlfqLevel::L0 => Some(MLFQ_0_ALLOTMENT),
            MlfqLevel::L1 => Some(MLFQ_1_ALLOTMENT),
            MlfqLevel::L2 => None,
        }
    }

    pub fn demote(self) -> MlfqLevel {
        match self {
            MlfqLevel::L0 => MlfqLevel::L1,
            MlfqLevel::L1 | MlfqLevel::L2 => MlfqLevel::L2,
        }
    }
}

/// Per-task MLFQ accounting.
#[derive(Copy, Clone, Debug, Default)]
pub struct MlfqState {
    pub level: MlfqLevel,
    /// Queue position within the level; higher means further back.
    pub priority: u32,
    /// Ticks accumulated at the current level.
    pub ticks: u32,
}

/// Per-task stride accounting. The stride itself is recomputed on demand
/// from the share and the number of threads in the process.
#[derive(Copy, Clone, Debug, Default)]
pub struct StrideState {
    pub pass: u64,
    pub cpu_share: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Task table full.
    NoSlot,
    /// Address-space or kernel-stack allocation failed.
    NoMemory,
    /// Invalid user pointer or integer argument.
    BadArg,
    /// thread_join by a slave, or for a thread of another master.
    NotMaster,
    /// wait() with nothing to reap.
    NoSuchChild,
    /// kill() with no matching master.
    NoSuchProcess,
    /// set_cpu_share() would break the MLFQ reserve.
    AdmissionDenied,
    /// The caller has been killed.
    Killed,
}

/// The code a task runs when it returns to user space.
pub type TaskEntry = Arc<dyn Fn(&mut UserEnv, u64) + Send + Sync>;

/// One slot of the task table. Every field is guarded by the table lock
/// except identities after the Embryo transition and the fields private to
/// the running task (trapframe, open files).
pub(crate) struct Task {
    pub state: TaskState,
    /// Process ID; threads of one process share it.
    pub pid: i32,
    /// 0 for the master thread, nonzero for slaves.
    pub tid: i32,
    /// Slot of this thread's master, `None` if self is the master.
    pub master: Option<usize>,
    /// Slot of the creating master.
    pub parent: Option<usize>,
    /// Shared page-table handle; identical across threads of one process.
    pub pagetable: Option<Pagetable>,
    /// Logical end of the address space. Authoritative on the master.
    pub sz: usize,
    /// Base of a slave's guard+stack pair; 0 on masters.
    pub vabase: usize,
    /// Recycled `vabase` values left behind by joined slaves. Master only.
    pub blank_regions: ArrayVec<usize, NPROC>,
    /// The kernel stack: a parked host thread.
    pub kstack: Option<JoinHandle<()>>,
    pub trapframe: Trapframe,
    /// If nonzero, sleeping on this channel.
    pub chan: Chan,
    /// Sticky kill flag; honored at the next return to user space.
    pub killed: bool,
    pub open_files: [Option<Arc<File>>; NOFILE],
    pub cwd: Option<Arc<Inode>>,
    pub name: ArrayString<16>,
    pub sched_mode: SchedMode,
    pub mlfq: MlfqState,
    pub stride: StrideState,
    /// Value passed to thread_exit, consumed once by thread_join.
    pub tmp_retval: u64,
    pub entry: Option<TaskEntry>,
    /// Entry handed in by the thread_create wrapper for the next syscall.
    pub staged_entry: Option<TaskEntry>,
}

impl Task {
    pub fn new() -> Task {
        Task {
            state: TaskState::Unused,
            pid: 0,
            tid: 0,
            master: None,
            parent: None,
            pagetable: None,
            sz: 0,
            vabase: 0,
            blank_regions: ArrayVec::new(),
            kstack: None,
            trapframe: Trapframe::new(),
            chan: 0,
            killed: false,
            open_files: [const { None }; NOFILE],
            cwd: None,
            name: ArrayString::new(),
            sched_mode: SchedMode::Mlfq,
            mlfq: MlfqState::default(),
            stride: StrideState::default(),
            tmp_retval: 0,
            entry: None,
            staged_entry: None,
        }
    }

    /// Slot of the master of this task's process, given this task's own slot.
    pub fn master_or(&self, own_slot: usize) -> usize {
        self.master.unwrap_or(own_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parameters_match_the_policy() {
        assert_eq!(MlfqLevel::L0.quantum(), 1);
        assert_eq!(MlfqLevel::L1.quantum(), 2);
        assert_eq!(MlfqLevel::L2.quantum(), 4);
        assert_eq!(MlfqLevel::L0.allotment(), Some(5));
        assert_eq!(MlfqLevel::L1.allotment(), Some(10));
        assert_eq!(MlfqLevel::L2.allotment(), None);
        assert_eq!(MlfqLevel::L2.demote(), MlfqLevel::L2);
    }

    #[test]
    fn slot_channels_are_distinct_and_nonzero() {
        assert_ne!(task_chan(0), 0);
        assert_ne!(task_chan(0), task_chan(1));
        assert_ne!(task_chan(0), CHAN_TICKS);
    }
}
