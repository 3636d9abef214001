use crate::proc::{Kernel, KernelError, MlfqLevel};
use log::warn;

/// System calls understood by the core. Numbers follow the classic table,
/// with the scheduler and thread extensions appended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Syscall {
    Fork,
    Exit,
    Wait,
    Kill,
    Getpid,
    Sbrk,
    Sleep,
    Uptime,
    Yield,
    Getlev,
    SetCpuShare,
    ThreadCreate,
    ThreadExit,
    ThreadJoin,
    Gettid,
    Getppid,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            6 => Ok(Syscall::Kill),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            22 => Ok(Syscall::Yield),
            23 => Ok(Syscall::Getlev),
            24 => Ok(Syscall::SetCpuShare),
            25 => Ok(Syscall::ThreadCreate),
            26 => Ok(Syscall::ThreadExit),
            27 => Ok(Syscall::ThreadJoin),
            28 => Ok(Syscall::Gettid),
            29 => Ok(Syscall::Getppid),
            _ => Err(()),
        }
    }
}

impl From<Syscall> for usize {
    fn from(syscall: Syscall) -> usize {
        match syscall {
            Syscall::Fork => 1,
            Syscall::Exit => 2,
            Syscall::Wait => 3,
            Syscall::Kill => 6,
            Syscall::Getpid => 11,
            Syscall::Sbrk => 12,
            Syscall::Sleep => 13,
            Syscall::Uptime => 14,
            Syscall::Yield => 22,
            Syscall::Getlev => 23,
            Syscall::SetCpuShare => 24,
            Syscall::ThreadCreate => 25,
            Syscall::ThreadExit => 26,
            Syscall::ThreadJoin => 27,
            Syscall::Gettid => 28,
            Syscall::Getppid => 29,
        }
    }
}

const FAILURE: u64 = -1i64 as u64;

fn result_to_ret<T: Into<i64>>(result: Result<T, KernelError>) -> u64 {
    match result {
        Ok(v) => {
            let v: i64 = v.into();
            v as u64
        }
        Err(_) => FAILURE,
    }
}

impl Syscall {
    fn call(self, kern: &Kernel) -> u64 {
        match self {
            Syscall::Fork => result_to_ret(kern.fork()),
            Syscall::Exit => kern.exit(),
            Syscall::Wait => result_to_ret(kern.wait()),
            Syscall::Kill => {
                let pid = argint(kern, 0);
                match kern.kill(pid) {
                    Ok(()) => 0,
                    Err(_) => FAILURE,
                }
            }
            Syscall::Getpid => kern.with_current(|p| p.pid as u64),
            Syscall::Sbrk => {
                let n = argint(kern, 0);
                match kern.growproc(n as i64) {
                    Ok(old_size) => old_size as u64,
                    Err(_) => FAILURE,
                }
            }
            Syscall::Sleep => {
                let n = argint(kern, 0);
                match kern.sleep_ticks(n as i64) {
                    Ok(()) => 0,
                    Err(_) => FAILURE,
                }
            }
            Syscall::Uptime => kern.uptime(),
            Syscall::Yield => {
                kern.yield_now();
                0
            }
            Syscall::Getlev => kern.with_current(|p| match p.mlfq.level {
                MlfqLevel::L0 => 0,
                MlfqLevel::L1 => 1,
                MlfqLevel::L2 => 2,
            }),
            Syscall::SetCpuShare => {
                let pct = argint(kern, 0);
                match kern.set_cpu_share(pct) {
                    Ok(()) => 0,
                    Err(_) => FAILURE,
                }
            }
            Syscall::ThreadCreate => {
                let out_tid = argaddr(kern, 0);
                let arg = argraw(kern, 2);
                // The entry is staged by the wrapper; registers cannot carry
                // a closure.
                let Some(entry) = kern.take_staged_entry() else {
                    return FAILURE;
                };
                match kern.thread_create(entry, arg) {
                    Ok(tid) => {
                        let copied = kern.with_current(|p| {
                            p.pagetable
                                .as_ref()
                                .expect("thread_create pagetable")
                                .lock()
                                .write_word(out_tid, tid as u64)
                        });
                        match copied {
                            Ok(()) => 0,
                            Err(_) => FAILURE,
                        }
                    }
                    Err(_) => FAILURE,
                }
            }
            Syscall::ThreadExit => {
                let retval = argraw(kern, 0);
                kern.thread_exit(retval)
            }
            Syscall::ThreadJoin => {
                let tid = argint(kern, 0);
                let out_retval = argaddr(kern, 1);
                match kern.thread_join(tid) {
                    Ok(retval) => {
                        let copied = kern.with_current(|p| {
                            p.pagetable
                                .as_ref()
                                .expect("thread_join pagetable")
                                .lock()
                                .write_word(out_retval, retval)
                        });
                        match copied {
                            Ok(()) => 0,
                            Err(_) => FAILURE,
                        }
                    }
                    Err(_) => FAILURE,
                }
            }
            Syscall::Gettid => kern.with_current(|p| p.tid as u64),
            Syscall::Getppid => kern.getppid() as u64,
        }
    }
}

fn argraw(kern: &Kernel, n: usize) -> u64 {
    kern.with_current(|p| match n {
        0 => p.trapframe.a0,
        1 => p.trapframe.a1,
        2 => p.trapframe.a2,
        3 => p.trapframe.a3,
        4 => p.trapframe.a4,
        5 => p.trapframe.a5,
        _ => panic!("argraw"),
    })
}

/// Fetch the n-th 32-bit syscall argument.
pub(crate) fn argint(kern: &Kernel, n: usize) -> i32 {
    argraw(kern, n) as i32
}

/// Fetch the n-th syscall argument as a user address. Legality is checked
/// by copyin/copyout at the point of use.
pub(crate) fn argaddr(kern: &Kernel, n: usize) -> usize {
    argraw(kern, n) as usize
}

/// Decode and run the syscall named by the current task's trapframe,
/// leaving the result in the return register.
pub(crate) fn syscall(kern: &Kernel) {
    let num = kern.with_current(|p| p.trapframe.a7) as usize;

    let ret = match Syscall::try_from(num) {
        Ok(call) => call.call(kern),
        Err(()) => {
            let pid = kern.with_current(|p| p.pid);
            warn!("{} unknown syscall {}", pid, num);
            FAILURE
        }
    };
    kern.with_current(|p| p.trapframe.a0 = ret);
}
