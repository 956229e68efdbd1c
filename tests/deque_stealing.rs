//! Integration coverage for the Chase-Lev work-stealing deque wired up
//! into a multi-worker pool: every pushed item is executed exactly once,
//! whether popped locally or stolen by an idle peer.

use oflux::scheduler::deque::{Steal, WorkStealingPool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn n_items_pushed_on_worker_zero_are_each_executed_exactly_once() {
    const N: usize = 5_000;
    const WORKERS: usize = 4;

    let (pool, workers) = WorkStealingPool::<usize>::new(WORKERS);
    for i in 0..N {
        workers[0].push(i);
    }

    let executed = Arc::new(Mutex::new(HashSet::with_capacity(N)));
    let remaining = Arc::new(AtomicUsize::new(N));

    let mut handles = Vec::new();
    for worker in workers {
        let executed = executed.clone();
        let remaining = remaining.clone();
        handles.push(thread::spawn(move || {
            while remaining.load(Ordering::Acquire) > 0 {
                match worker.get_work() {
                    Some(item) => {
                        let mut seen = executed.lock().unwrap();
                        assert!(seen.insert(item), "item {item} executed more than once");
                        drop(seen);
                        remaining.fetch_sub(1, Ordering::AcqRel);
                    }
                    None => {
                        if remaining.load(Ordering::Acquire) == 0 {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let seen = executed.lock().unwrap();
    assert_eq!(seen.len(), N, "every pushed item executed exactly once");
    let _ = &pool; // kept alive for the stealers' Arc<WorkStealingDeque> references
}

#[test]
fn concurrent_steal_never_duplicates_a_concurrent_local_pop() {
    let (pool, mut workers) = WorkStealingPool::<usize>::new(2);
    let victim = workers.remove(0);
    let stealer = pool.stealer(0).unwrap();

    for i in 0..2_000 {
        victim.push(i);
    }

    let stolen = Arc::new(Mutex::new(Vec::new()));
    let popped = Arc::new(Mutex::new(Vec::new()));

    let stolen_thread = {
        let stolen = stolen.clone();
        thread::spawn(move || loop {
            match stealer.steal() {
                Steal::Success(v) => stolen.lock().unwrap().push(v),
                Steal::Empty => break,
                Steal::Retry => thread::yield_now(),
            }
        })
    };

    while let Some(v) = victim.pop() {
        popped.lock().unwrap().push(v);
    }
    stolen_thread.join().unwrap();

    let popped = popped.lock().unwrap();
    let stolen = stolen.lock().unwrap();
    let mut all: Vec<usize> = popped.iter().chain(stolen.iter()).copied().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), popped.len() + stolen.len(), "no item was both popped and stolen");
}
