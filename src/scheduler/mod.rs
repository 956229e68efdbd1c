//! Scheduler: the many-thread event dispatcher (spec §4.2).
//!
//! Owns the worker list, the process-wide `manager_lock` (held only for
//! flow (re)load and worker list changes -- never on the hot path of pop
//! / execute / guard-acquire / push), and the shared flow pointer workers
//! read through. Grounded in spec.md §4.2 directly; the park/wake and
//! lifecycle-flag shape follows
//! `original_source/src/runtime/lockfree/OFluxLockfreeRunTimeThread.h`'s
//! `RunTime`/`RunTimeThread` pairing, built with `parking_lot` the way
//! this crate's teacher pairs `Condvar`+`Mutex` in its lock manager.

pub mod deque;
pub mod dispatch;
pub mod worker;

use crate::atomics_holder::acquire_all_or_wait;
use crate::config::RuntimeConfig;
use crate::event::Event;
use crate::flow::Flow;
use crate::guard::GuardTable;
use deque::Stealer;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use worker::{WorkerHandle, CURRENT_WORKER, NEXT_WORKER_ID};

/// The work-stealing scheduler: a pool of [`WorkerHandle`]s sharing a
/// [`GuardTable`] and a swappable [`Flow`].
pub struct Scheduler {
    pub guard_table: Arc<GuardTable>,
    pub config: RuntimeConfig,
    flow: RwLock<Arc<Flow>>,
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Held for flow (re)load, starting/retiring a worker, and
    /// diagnostic scans of the worker list -- spec.md §5's "locking
    /// discipline". Never taken on the hot path.
    manager_lock: Mutex<()>,
    running: AtomicBool,
    detached_count: AtomicUsize,
}

impl Scheduler {
    /// Build a scheduler over `flow` and `guard_table`, but do not start
    /// any worker threads yet -- call [`Scheduler::start`] for that, the
    /// way `original_source`'s `RunTime::start()` separates construction
    /// (which loads the flow) from running worker 0.
    pub fn new(config: RuntimeConfig, flow: Flow, guard_table: Arc<GuardTable>) -> Arc<Self> {
        Arc::new(Self {
            guard_table,
            config,
            flow: RwLock::new(Arc::new(flow)),
            workers: RwLock::new(Vec::new()),
            join_handles: Mutex::new(Vec::new()),
            manager_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            detached_count: AtomicUsize::new(0),
        })
    }

    pub fn current_flow(&self) -> Arc<Flow> {
        self.flow.read().clone()
    }

    /// Seed worker 0 with every initial and source event that acquires its
    /// guards synchronously, then spin up `initial_thread_pool_size`
    /// workers (spec.md §4.2 step 1). An event that can't acquire all of
    /// its guards up front parks on them exactly as a dispatched
    /// successor would, and surfaces later through `release`.
    pub fn start(self: &Arc<Self>) {
        let _guard = self.manager_lock.lock();
        self.running.store(true, Ordering::Release);

        let initial_count = self.config.initial_thread_pool_size.max(1);
        let mut workers = self.workers.write();
        for _ in 0..initial_count {
            workers.push(self.spawn_worker_handle());
        }
        let worker0 = workers[0].clone();
        drop(workers);

        for ev in self.seed_events() {
            if acquire_all_or_wait(&self.guard_table, &ev) {
                worker0.deque.push(ev);
            }
        }

        let handles: Vec<_> = self.workers.read().clone();
        drop(_guard);
        for handle in handles {
            self.spawn_worker_thread(handle);
        }
    }

    fn seed_events(&self) -> Vec<Arc<Event>> {
        let flow = self.current_flow();
        let mut events = Vec::new();
        for &id in &flow.initial_nodes {
            let node = flow.node(id);
            let ev = Event::new(id, Vec::new(), None, node.guards.len());
            ev.atomics.lock().set_guards(node.guards.clone());
            events.push(ev);
        }
        for id in flow.source_nodes() {
            let node = flow.node(id);
            let ev = Event::new(id, Vec::new(), None, node.guards.len());
            ev.atomics.lock().set_guards(node.guards.clone());
            events.push(ev);
        }
        events
    }

    fn spawn_worker_handle(&self) -> Arc<WorkerHandle> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        WorkerHandle::new(id, self.config.queue_allowance)
    }

    fn spawn_worker_thread(self: &Arc<Self>, handle: Arc<WorkerHandle>) {
        let scheduler = self.clone();
        let builder = std::thread::Builder::new()
            .name(format!("oflux-worker-{}", handle.id))
            .stack_size(self.config.stack_size);
        let join = builder
            .spawn(move || worker::run(scheduler, handle))
            .expect("failed to spawn oflux worker thread");
        self.join_handles.lock().push(join);
    }

    /// Add one more worker at runtime, honoring `max_thread_pool_size`
    /// (`0` means unlimited). Returns `false` if the cap would be
    /// exceeded.
    pub fn grow(self: &Arc<Self>) -> bool {
        let _guard = self.manager_lock.lock();
        let mut workers = self.workers.write();
        if self.config.exceeds_pool_cap(workers.len() + 1) {
            return false;
        }
        let handle = self.spawn_worker_handle();
        workers.push(handle.clone());
        drop(workers);
        drop(_guard);
        self.spawn_worker_thread(handle);
        true
    }

    /// Every peer's stealer handle except `exclude_id`'s own, for
    /// `worker::steal_from_peers`.
    pub(crate) fn peer_deques(&self, exclude_id: usize) -> Vec<Stealer<Arc<Event>>> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.id != exclude_id)
            .map(|w| Stealer::new(w.deque.clone()))
            .collect()
    }

    /// Append `events` to the submitting thread's own worker deque if
    /// the caller is a worker, else to worker 0 -- spec.md §4.2's
    /// `submit()`, safe to call from any thread.
    pub fn submit(self: &Arc<Self>, events: Vec<Arc<Event>>) {
        if events.is_empty() {
            return;
        }
        let current = CURRENT_WORKER.with(|c| c.borrow().clone());
        match current {
            Some(handle) => {
                for ev in events {
                    handle.deque.push(ev);
                }
            }
            None => {
                let workers = self.workers.read();
                let worker0 = workers.first().expect("scheduler has at least one worker after start()");
                for ev in events {
                    worker0.deque.push(ev);
                }
            }
        }
        self.wake_one();
    }

    /// Wake any one parked worker. Targeted, not a thundering herd --
    /// each worker has its own condition variable.
    pub(crate) fn wake_one(&self) {
        if let Some(w) = self.workers.read().iter().find(|w| w.is_asleep()) {
            w.wake();
        }
    }

    /// Wake a parked worker other than `exclude_id`, used when a worker
    /// detaches to keep runtime parallelism up.
    pub(crate) fn wake_one_other(&self, exclude_id: usize) {
        if let Some(w) = self.workers.read().iter().find(|w| w.id != exclude_id && w.is_asleep()) {
            w.wake();
        }
    }

    fn wake_all(&self) {
        for w in self.workers.read().iter() {
            w.wake();
        }
    }

    /// `true` and increments the detached count if the configured
    /// `max_detached_threads` budget (`0` = unlimited) is not exhausted.
    pub(crate) fn try_enter_detached(&self) -> bool {
        loop {
            let cur = self.detached_count.load(Ordering::Acquire);
            if self.config.exceeds_detached_cap(cur + 1) {
                return false;
            }
            if self
                .detached_count
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn leave_detached(&self) {
        self.detached_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn detached_count(&self) -> usize {
        self.detached_count.load(Ordering::Acquire)
    }

    /// Clear `running` on every worker and wake them all; each worker
    /// drains its own deque before exiting (spec.md §4.2's `soft_kill`).
    /// Does not join the worker threads -- call [`Scheduler::join`] for
    /// that.
    pub fn soft_kill(&self) {
        tracing::info!("soft_kill requested");
        for w in self.workers.read().iter() {
            w.running.store(false, Ordering::Release);
        }
        self.running.store(false, Ordering::Release);
        self.wake_all();
    }

    /// `soft_kill`, plus send a native interrupt (`SIGUSR1`) to every
    /// worker thread so one parked inside an external blocking syscall
    /// (observed through the shim, see `crate::shim`) returns `EINTR`
    /// instead of staying blocked past `soft_kill`'s cooperative flag
    /// check. Matches `original_source`'s `oflux_kill_int` loop in
    /// `RunTime::hard_kill`.
    #[cfg(unix)]
    pub fn hard_kill(&self) {
        self.soft_kill();
        tracing::warn!("hard_kill requested, sending interrupts to worker threads");
        install_interrupt_handler();
        for w in self.workers.read().iter() {
            w.send_interrupt();
        }
    }

    /// Block until every worker thread has exited. Call after
    /// [`Scheduler::soft_kill`] or [`Scheduler::hard_kill`].
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.join_handles.lock());
        for h in handles {
            let _ = h.join();
        }
    }

    /// Swap in a new flow atomically under the manager lock (spec.md
    /// §4.8/§5: old flows are kept alive only by in-flight events' Arc
    /// references, there is no explicit epoch to wait out here since
    /// events hold `Arc<Flow>` snapshots, not raw pointers).
    pub fn reload(&self, new_flow: Flow) {
        let _guard = self.manager_lock.lock();
        *self.flow.write() = Arc::new(new_flow);
        tracing::info!("flow reloaded");
    }

    /// Read-only introspection: queue lengths, detached count, and
    /// per-worker wait state, matching the shape (not the exact text) of
    /// `original_source`'s `RunTimeThread::log_snapshot`.
    pub fn log_snapshot(&self) -> Vec<WorkerSnapshot> {
        let _guard = self.manager_lock.lock();
        self.workers
            .read()
            .iter()
            .map(|w| WorkerSnapshot {
                id: w.id,
                queue_len: w.queue_len(),
                asleep: w.is_asleep(),
                detached: w.is_detached(),
                current_event: w.current_event(),
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Install a no-op `SIGUSR1` handler once per process. Without this the
/// default disposition (terminate) would turn `hard_kill`'s interrupt
/// into a process kill the first time it raced a worker that wasn't
/// actually blocked in a syscall.
#[cfg(unix)]
fn install_interrupt_handler() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGUSR1, noop_signal_handler as libc::sighandler_t);
    });
}

#[cfg(unix)]
extern "C" fn noop_signal_handler(_: libc::c_int) {}

/// One worker's state as of a `log_snapshot()` call.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub queue_len: usize,
    pub asleep: bool,
    pub detached: bool,
    pub current_event: Option<crate::event::EventId>,
}
