mod common;

use common::{assert_invariants, run_until};
use schedos::{Kernel, KernelError, TaskState, NPROC, PGSIZE};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

#[test]
fn fork_then_wait_reaps_exactly_once() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("forker", 1, move |env, arg| {
                if arg == 0 {
                    // The fork child observes 0 and leaves immediately.
                    env.exit();
                }
                let pid = env.fork();
                let first = env.wait();
                let second = env.wait();
                results.lock().unwrap().extend([pid, first, second]);
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 200, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert!(r[0] > 1, "child pid should be fresh, got {}", r[0]);
    assert_eq!(r[1], r[0], "wait returns the child's pid");
    assert_eq!(r[2], -1, "second wait has nothing to reap");
    assert_invariants(&kernel);
}

#[test]
fn identity_syscalls() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("ident", 0, move |env, _| {
                results
                    .lock()
                    .unwrap()
                    .extend([env.getpid(), env.getppid(), env.gettid()]);
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 50, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert!(r[0] > 1);
    assert_eq!(r[1], 1, "spawned processes are children of init");
    assert_eq!(r[2], 0, "a process's only thread is the master");
}

#[test]
fn sbrk_returns_old_size_and_grows() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("grower", 0, move |env, _| {
                let old = env.sbrk(2 * PGSIZE as i64);
                let now = env.sbrk(0);
                let shrunk = env.sbrk(-(PGSIZE as i64));
                let end = env.sbrk(0);
                results.lock().unwrap().extend([old, now, shrunk, end]);
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 50, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert_eq!(r[0], PGSIZE as i64);
    assert_eq!(r[1], 3 * PGSIZE as i64);
    assert_eq!(r[2], 3 * PGSIZE as i64);
    assert_eq!(r[3], 2 * PGSIZE as i64);
}

#[test]
fn uptime_advances_with_ticks() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("clockwatch", 0, move |env, _| {
                let t0 = env.uptime();
                env.tick();
                env.tick();
                let t1 = env.uptime();
                results.lock().unwrap().extend([t0, t1]);
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 50, || done.load(Ordering::SeqCst)));
    let r = results.lock().unwrap().clone();
    assert!(r[1] > r[0], "clock must advance across ticks: {r:?}");
}

#[test]
fn kill_is_sticky_and_idempotent() {
    let kernel = Kernel::new();
    let pid = kernel
        .spawn("victim", 0, |env, _| loop {
            env.tick();
        })
        .unwrap();

    // Let it run a little first.
    kernel.run(0, 5);
    assert!(kernel.kill(pid).is_ok());
    assert!(kernel.kill(pid).is_ok(), "kill is idempotent");

    assert!(run_until(&kernel, 100, || kernel
        .dump()
        .iter()
        .all(|t| t.pid != pid)));
    assert_eq!(kernel.kill(pid), Err(KernelError::NoSuchProcess));
    assert_invariants(&kernel);
}

#[test]
fn kill_unknown_pid_fails() {
    let kernel = Kernel::new();
    assert_eq!(kernel.kill(4242), Err(KernelError::NoSuchProcess));
}

#[test]
fn killed_sleeper_wakes_and_exits_promptly() {
    let kernel = Kernel::new();
    let pid = kernel
        .spawn("dozer", 0, |env, _| {
            env.sleep(100_000);
            env.exit();
        })
        .unwrap();

    assert!(run_until(&kernel, 50, || kernel
        .dump()
        .iter()
        .any(|t| t.pid == pid && t.state == TaskState::Sleeping)));

    assert!(kernel.kill(pid).is_ok());
    // Far fewer passes than the requested sleep: the kill must cut it short.
    assert!(run_until(&kernel, 100, || kernel
        .dump()
        .iter()
        .all(|t| t.pid != pid)));
}

#[test]
fn wait_without_children_fails() {
    let kernel = Kernel::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let results = Arc::clone(&results);
        let done = Arc::clone(&done);
        kernel
            .spawn("childless", 0, move |env, _| {
                results.lock().unwrap().push(env.wait());
                done.store(true, Ordering::SeqCst);
                env.exit();
            })
            .unwrap();
    }

    assert!(run_until(&kernel, 50, || done.load(Ordering::SeqCst)));
    assert_eq!(results.lock().unwrap().as_slice(), &[-1]);
}

#[test]
fn fork_duplicates_open_files() {
    let kernel = Kernel::new();
    let root = kernel
        .spawn("filer", 1, |env, arg| {
            if arg == 0 {
                loop {
                    env.tick();
                }
            }
            env.fork();
            loop {
                env.tick();
            }
        })
        .unwrap();

    assert!(run_until(&kernel, 100, || kernel
        .dump()
        .iter()
        .any(|t| t.parent_pid == Some(root))));

    let dump = kernel.dump();
    let parent = dump.iter().find(|t| t.pid == root).unwrap();
    let child = dump.iter().find(|t| t.parent_pid == Some(root)).unwrap();
    assert_eq!(parent.open_files, 2);
    assert_eq!(child.open_files, 2, "fork dups the parent's file refs");
    assert_ne!(child.pid, parent.pid);

    kernel.kill(child.pid).unwrap();
    kernel.kill(root).unwrap();
    assert!(run_until(&kernel, 200, || kernel.dump().len() == 1));
    assert_invariants(&kernel);
}

#[test]
fn table_fills_to_capacity() {
    let kernel = Kernel::new();
    let mut spawned = 0;
    let err = loop {
        match kernel.spawn("filler", 0, |env, _| loop {
            env.tick();
        }) {
            Ok(_) => spawned += 1,
            Err(e) => break e,
        }
    };
    // Init already owns one slot.
    assert_eq!(spawned, NPROC - 1);
    assert_eq!(err, KernelError::NoSlot);
}

#[test]
fn two_cpus_smoke() {
    let kernel = Kernel::new();
    for i in 0..4 {
        kernel
            .spawn(&format!("spin{i}"), 0, |env, _| loop {
                env.tick();
            })
            .unwrap();
    }

    let other = Arc::clone(&kernel);
    let worker = std::thread::spawn(move || other.run(1, 200).len());
    let here = kernel.run(0, 200).len();
    let there = worker.join().unwrap();

    assert!(here + there > 0);
    assert_invariants(&kernel);
}
