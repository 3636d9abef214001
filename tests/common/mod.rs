#![allow(dead_code)]

use schedos::{Kernel, PGSIZE};
use std::collections::HashMap;

/// Drive CPU 0 until `pred` holds, giving up after `max` passes.
pub fn run_until<F: FnMut() -> bool>(kernel: &Kernel, max: usize, mut pred: F) -> bool {
    for _ in 0..max {
        if pred() {
            return true;
        }
        kernel.schedule(0);
    }
    pred()
}

/// The table-wide invariants that must hold between scheduler passes.
pub fn assert_invariants(kernel: &Kernel) {
    let dump = kernel.dump();
    let stats = kernel.stats();

    // At most one master per pid.
    let mut masters: HashMap<i32, usize> = HashMap::new();
    for task in &dump {
        if task.tid == 0 {
            *masters.entry(task.pid).or_default() += 1;
        }
    }
    for (pid, count) in masters {
        assert!(count <= 1, "pid {pid} has {count} masters");
    }

    // Tasks sharing a pid share the address space handle.
    for a in &dump {
        for b in &dump {
            if a.pid == b.pid && a.slot != b.slot {
                assert!(
                    kernel.same_address_space(a.slot, b.slot),
                    "pid {} slots {} and {} have different address spaces",
                    a.pid,
                    a.slot,
                    b.slot
                );
            }
        }
    }

    // The MLFQ pool keeps its reserve and the budget never oversubscribes.
    assert!(stats.total_cpu + stats.mlfq_cpu_share <= 100);
    assert!(stats.mlfq_cpu_share >= 20);

    // Sleepers have a channel; slave stack regions are page-aligned and lie
    // inside the master's address space.
    for task in &dump {
        if task.state == schedos::TaskState::Sleeping {
            assert_ne!(task.chan, 0, "sleeping pid {} without chan", task.pid);
        }
        if let Some(master_slot) = task.master_slot {
            assert_eq!(task.vabase % PGSIZE, 0);
            let master = dump
                .iter()
                .find(|t| t.slot == master_slot)
                .expect("slave without live master");
            assert!(task.vabase < master.sz);
        }
    }
}
