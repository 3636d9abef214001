/// Maximum number of tasks (processes and threads combined)
pub const NPROC: usize = 64;
/// Maximum number of CPUs
pub const NCPU: usize = 8;
/// Maximum number of open files per process
pub const NOFILE: usize = 16;
/// Bytes per page
pub const PGSIZE: usize = 4096;
/// Host stack size backing one kernel stack
pub const KSTACKSIZE: usize = 256 * 1024;

/// Time quantum of each MLFQ level, in ticks
pub const MLFQ_0_QUANTUM: u32 = 1;
pub const MLFQ_1_QUANTUM: u32 = 2;
pub const MLFQ_2_QUANTUM: u32 = 4;

/// Total ticks a task may accumulate at a level before demotion
pub const MLFQ_0_ALLOTMENT: u32 = 5;
pub const MLFQ_1_ALLOTMENT: u32 = 10;

/// Boost all MLFQ tasks back to the top level with this frequency (ticks)
pub const MLFQ_BOOSTING_FREQUENCY: u32 = 100;

/// CPU percentage that can never be promised away from the MLFQ pool
pub const MLFQ_MIN_PORTION: i32 = 20;

/// Fixed-point scale for stride/pass arithmetic
pub const PASS_SCALE: u64 = 1 << 16;

/// Fake return address pushed under a new thread's stack frame
pub const THREAD_SENTINEL: u64 = 0xffff_ffff;
