mod common;

use common::{assert_invariants, run_until};
use schedos::{Kernel, PGSIZE, THREAD_SENTINEL};
use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Mutex,
};

#[test]
fn thread_join_returns_retvals_in_order() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("master", 0, move |env, _| {
                let mut tids = Vec::new();
                for i in 1..=10u64 {
                    let out_tid = 0x100 + 8 * i as usize;
                    let rc = env.thread_create(out_tid, i, |worker, arg| {
                        worker.thread_exit(arg);
                    });
                    assert_eq!(rc, 0);
                    tids.push(env.read_word(out_tid).unwrap() as i32);
                }
                for tid in tids {
                    let rc = env.thread_join(tid, 0x200);
                    assert_eq!(rc, 0);
                    results.lock().unwrap().push(env.read_word(0x200).unwrap());
                }
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 500, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert_eq!(r, (1..=10).collect::<Vec<u64>>());
    // Every joined slot is reclaimed; only init survives.
    assert!(run_until(&kernel, 50, || kernel.dump().len() == 1));
}

#[test]
fn blank_regions_are_reused_in_lifo_order() {
    let kernel = Kernel::new();
    let done = Arc::new(AtomicBool::new(false));

    {
        let done = Arc::clone(&done);
        kernel
            .spawn("recycler", 0, move |env, _| {
                env.thread_create(0x100, 0, |worker, _| worker.thread_exit(0));
                let t1 = env.read_word(0x100).unwrap() as i32;
                env.thread_join(t1, 0x108);

                env.thread_create(0x110, 0, |worker, _| loop {
                    worker.tick();
                });
                done.store(true, Ordering::SeqCst);
                loop {
                    env.tick();
                }
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 200, || done.load(Ordering::SeqCst)));

    let dump = kernel.dump();
    let master = dump.iter().find(|t| t.name == "recycler" && t.tid == 0).unwrap();
    let slave = dump.iter().find(|t| t.pid == master.pid && t.tid != 0).unwrap();

    // The second thread reuses the first one's region: the address space
    // never grew past the first creation.
    assert_eq!(slave.vabase, PGSIZE, "joined thread's region is reused");
    assert_eq!(master.sz, 3 * PGSIZE, "master size unchanged by the reuse");
    assert!(master.blank_regions.is_empty());
    assert_invariants(&kernel);
}

#[test]
fn thread_stack_carries_arg_and_sentinel() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("stacker", 0, move |env, _| {
                let seen = Arc::new(AtomicI64::new(-1));
                {
                    let seen = Arc::clone(&seen);
                    env.thread_create(0x100, 0xabcd, move |worker, arg| {
                        seen.store(arg as i64, Ordering::SeqCst);
                        loop {
                            worker.tick();
                        }
                    });
                }
                // Let the worker report in.
                while seen.load(Ordering::SeqCst) < 0 {
                    env.tick();
                }

                // The worker's region is [PGSIZE, 3*PGSIZE): guard page low,
                // stack page high. Argument on top, fake return under it.
                let stack_top = 3 * PGSIZE;
                let guard_write_rejected = !env.write_word(PGSIZE + 8, 1);
                results.lock().unwrap().extend([
                    seen.load(Ordering::SeqCst) as u64,
                    env.read_word(stack_top - 8).unwrap(),
                    env.read_word(stack_top - 16).unwrap(),
                    guard_write_rejected as u64,
                ]);
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 200, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert_eq!(r[0], 0xabcd, "entry receives the argument");
    assert_eq!(r[1], 0xabcd, "argument sits atop the stack");
    assert_eq!(r[2], THREAD_SENTINEL, "fake return address under it");
    assert_eq!(r[3], 1, "guard page rejects user writes");
}

#[test]
fn fork_inside_a_thread_sizes_from_the_master() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let master_pid = {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("master", 0, move |env, _| {
                let results_t = Arc::clone(&results);
                env.thread_create(0x100, 7, move |worker, targ| {
                    if targ == 0 {
                        // Fork child: re-enters the slave's program as a
                        // fresh master with 0 in the return register.
                        results_t.lock().unwrap().extend([
                            worker.getpid(),
                            worker.getppid(),
                            worker.gettid(),
                            worker.sbrk(0),
                        ]);
                        worker.exit();
                    }
                    let child = worker.fork();
                    results_t.lock().unwrap().push(child);
                    worker.thread_exit(0);
                });
                let tid = env.read_word(0x100).unwrap() as i32;
                env.thread_join(tid, 0x108);
                let reaped = env.wait();
                results.lock().unwrap().push(reaped);
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap()
    };

    assert!(run_until(&kernel, 300, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    // Order: child pid (from the forking slave), the child's own records,
    // then the master's wait.
    let child_pid = r[0];
    assert!(child_pid > 1);
    assert_ne!(child_pid, master_pid as i64);
    assert_eq!(r[1], child_pid, "child sees its own fresh pid");
    assert_eq!(
        r[2],
        master_pid as i64,
        "child's parent resolves to the live master"
    );
    assert_eq!(r[3], 0, "fork child is a master thread");
    assert_eq!(r[4], 3 * PGSIZE as i64, "child is sized from the master");
    assert_eq!(r[5], child_pid, "the master reaps the child");
    assert_invariants(&kernel);
}

#[test]
fn thread_join_rejects_non_masters() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("master", 0, move |env, _| {
                env.thread_create(0x100, 0, |worker, _| loop {
                    worker.tick();
                });
                let spinner = env.read_word(0x100).unwrap();

                let results_t = Arc::clone(&results);
                let done_t = Arc::clone(&done);
                env.thread_create(0x108, spinner, move |worker, target| {
                    // A slave may not join its sibling.
                    results_t
                        .lock()
                        .unwrap()
                        .push(worker.thread_join(target as i32, 0x300));
                    done_t.store(true, Ordering::SeqCst);
                    worker.thread_exit(0);
                });
                loop {
                    env.tick();
                }
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 200, || done.load(Ordering::SeqCst)));
    assert_eq!(results.lock().unwrap().as_slice(), &[-1]);
}

#[test]
fn thread_join_rejects_foreign_masters() {
    let kernel = Kernel::new();
    let spinner_tid = Arc::new(AtomicI64::new(-1));
    let verdict = Arc::new(AtomicI64::new(i64::MIN));

    {
        let spinner_tid = Arc::clone(&spinner_tid);
        kernel
            .spawn("owner", 0, move |env, _| {
                env.thread_create(0x100, 0, |worker, _| loop {
                    worker.tick();
                });
                spinner_tid.store(env.read_word(0x100).unwrap() as i64, Ordering::SeqCst);
                loop {
                    env.tick();
                }
            })
            .unwrap();
    }
    assert!(run_until(&kernel, 100, || spinner_tid.load(Ordering::SeqCst) > 0));

    {
        let spinner_tid = Arc::clone(&spinner_tid);
        let verdict = Arc::clone(&verdict);
        kernel
            .spawn("intruder", 0, move |env, _| {
                let target = spinner_tid.load(Ordering::SeqCst) as i32;
                verdict.store(env.thread_join(target, 0x100), Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 100, || verdict.load(Ordering::SeqCst) != i64::MIN));
    assert_eq!(verdict.load(Ordering::SeqCst), -1);
}

#[test]
fn master_exit_collects_live_slaves() {
    let kernel = Kernel::new();
    let pid = kernel
        .spawn("shortlived", 0, |env, _| {
            env.thread_create(0x100, 0, |worker, _| loop {
                worker.tick();
            });
            env.thread_create(0x108, 0, |worker, _| loop {
                worker.tick();
            });
            for _ in 0..5 {
                env.tick();
            }
            env.exit();
        })
        .unwrap();

    assert!(run_until(&kernel, 100, || kernel
        .dump()
        .iter()
        .filter(|t| t.pid == pid)
        .count()
        == 3));

    // The master's exit kills both slaves, collects them, and init reaps
    // the master itself.
    assert!(run_until(&kernel, 200, || kernel.dump().len() == 1));
    assert_invariants(&kernel);
}

#[test]
fn exec_coordination_leaves_one_master() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let pid = {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("execer", 0, move |env, _| {
                let results_t = Arc::clone(&results);
                let done_t = Arc::clone(&done);
                env.thread_create(0x100, 0, move |worker, _| {
                    // This slave replaces the whole process, as exec would.
                    worker.kill_except();
                    worker.wakeup_except();
                    results_t
                        .lock()
                        .unwrap()
                        .extend([worker.gettid(), worker.getpid()]);
                    done_t.store(true, Ordering::SeqCst);
                    worker.exit();
                });
                env.thread_create(0x108, 0, |worker, _| loop {
                    worker.tick();
                });
                loop {
                    env.tick();
                }
            })
            .unwrap()
    };

    assert!(run_until(&kernel, 300, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert_eq!(r[0], 0, "the survivor inherits the master identity");
    assert_eq!(r[1], pid as i64, "the pid is preserved across the takeover");

    // The survivor exits as an ordinary process; init reaps it.
    assert!(run_until(&kernel, 200, || kernel.dump().len() == 1));
    assert_invariants(&kernel);
}

#[test]
fn slaves_share_the_address_space() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("sharer", 0, move |env, _| {
                let results_t = Arc::clone(&results);
                let done_t = Arc::clone(&done);
                env.thread_create(0x100, 0, move |worker, _| {
                    // sbrk from a slave grows through the master.
                    let old = worker.sbrk(PGSIZE as i64);
                    results_t.lock().unwrap().push(old);
                    done_t.store(true, Ordering::SeqCst);
                    loop {
                        worker.tick();
                    }
                });
                loop {
                    env.tick();
                }
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 200, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert_eq!(r[0], 3 * PGSIZE as i64, "slave sbrk reads the master's size");

    let dump = kernel.dump();
    let master = dump.iter().find(|t| t.name == "sharer" && t.tid == 0).unwrap();
    let slave = dump.iter().find(|t| t.pid == master.pid && t.tid != 0).unwrap();
    assert_eq!(master.sz, 4 * PGSIZE, "growth lands on the master");
    assert!(kernel.same_address_space(master.slot, slave.slot));
    assert_invariants(&kernel);
}
