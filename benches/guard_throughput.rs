// Guard acquire/release throughput under contention: exclusive, read-write,
// and pool guards, single-threaded and with a handful of concurrent threads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use oflux::event::Event;
use oflux::flow::AccessMode;
use oflux::guard::{GuardKind, GuardTable};
use std::sync::{Arc, Barrier};
use std::thread;

fn drain(guard: &Arc<dyn oflux::guard::Guard>, holder: &Arc<Event>) {
    for woken in guard.release(holder) {
        woken.clear_parked();
    }
}

fn bench_exclusive_uncontended(c: &mut Criterion) {
    let table = GuardTable::new();
    let id = table.get_or_create("g", GuardKind::Exclusive);
    let guard = table.get(id).unwrap();

    c.bench_function("exclusive_acquire_release_uncontended", |b| {
        b.iter(|| {
            let ev = Event::new(0, vec![], None, 0);
            guard.acquire_or_wait(ev.clone(), AccessMode::Exclusive);
            drain(&guard, black_box(&ev));
        });
    });
}

fn bench_exclusive_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("exclusive_acquire_release_concurrent");

    for num_threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(num_threads), &num_threads, |b, &num_threads| {
            b.iter(|| {
                let table = GuardTable::new();
                let id = table.get_or_create("g", GuardKind::Exclusive);
                let barrier = Arc::new(Barrier::new(num_threads));

                let handles: Vec<_> = (0..num_threads)
                    .map(|_| {
                        let guard = table.get(id).unwrap();
                        let barrier = barrier.clone();
                        thread::spawn(move || {
                            barrier.wait();
                            for _ in 0..200 {
                                let ev = Event::new(0, vec![], None, 0);
                                let mut acquired = guard.acquire_or_wait(ev.clone(), AccessMode::Exclusive);
                                while !acquired {
                                    thread::yield_now();
                                    acquired = !ev.is_parked();
                                }
                                drain(&guard, &ev);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_rwlock_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("rwlock_readers_concurrent");

    for num_readers in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(num_readers), &num_readers, |b, &num_readers| {
            b.iter(|| {
                let table = GuardTable::new();
                let id = table.get_or_create("g", GuardKind::ReadWrite);
                let barrier = Arc::new(Barrier::new(num_readers));

                let handles: Vec<_> = (0..num_readers)
                    .map(|_| {
                        let guard = table.get(id).unwrap();
                        let barrier = barrier.clone();
                        thread::spawn(move || {
                            barrier.wait();
                            for _ in 0..200 {
                                let ev = Event::new(0, vec![], None, 0);
                                let mut acquired = guard.acquire_or_wait(ev.clone(), AccessMode::Read);
                                while !acquired {
                                    thread::yield_now();
                                    acquired = !ev.is_parked();
                                }
                                drain(&guard, &ev);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_pool_handout(c: &mut Criterion) {
    c.bench_function("pool_handout_release_cycle", |b| {
        b.iter(|| {
            let table = GuardTable::new();
            let id = table.create_pool("p", vec!["a", "b", "c", "d"].into_iter());
            let guard = table.get(id).unwrap();

            let events: Vec<_> = (0..4).map(|_| Event::new(0, vec![], None, 0)).collect();
            for ev in &events {
                guard.acquire_or_wait(ev.clone(), AccessMode::Exclusive);
            }
            for ev in black_box(&events) {
                drain(&guard, ev);
            }
        });
    });
}

criterion_group!(benches, bench_exclusive_uncontended, bench_exclusive_concurrent, bench_rwlock_readers, bench_pool_handout);
criterion_main!(benches);
