//! The core of a teaching operating-system kernel: its process/thread table,
//! hybrid two-tier CPU scheduler, and lifecycle primitives.
//!
//! Three tightly coupled subsystems share one table-wide spinlock:
//!
//! - a hybrid scheduler combining a multi-level feedback queue for ordinary
//!   tasks with a stride scheduler for tasks holding a reserved CPU share
//!   (the MLFQ pool participates in stride as a single pseudo-client);
//! - a kernel-level thread model in which the threads of one process share
//!   an address space and file table, with one designated master;
//! - the sleep/wakeup/kill primitives coordinating task state transitions,
//!   plus the context-switch hand-off into per-CPU scheduler loops.
//!
//! The crate is an executable model: the task table is an arena of `NPROC`
//! slots whose cross-references are slot indices, each allocated slot owns a
//! parked host thread as its kernel stack, and `swtch` hands control (and
//! the table lock) between stacks explicitly. Driving a single CPU yields a
//! fully deterministic schedule:
//!
//! ```
//! use schedos::Kernel;
//!
//! let kernel = Kernel::new();
//! kernel
//!     .spawn("main", 0, |env, _arg| {
//!         for _ in 0..3 {
//!             env.tick();
//!         }
//!         env.exit();
//!     })
//!     .unwrap();
//! kernel.run(0, 16);
//! ```

pub mod file;
pub mod mem;
pub mod param;
pub mod proc;
pub mod sync;
pub mod syscall;
mod trap;
pub mod user;

pub use param::*;
pub use proc::{
    Chan, Kernel, KernelError, MlfqLevel, MlfqState, SchedMode, SchedStats, StrideState, TaskInfo,
    TaskState, Trapframe,
};
pub use syscall::Syscall;
pub use user::UserEnv;
