//! One worker: an owned deque, a parking condition variable, and the
//! `handle()` step that pops/runs/dispatches a single event (spec §4.2).
//!
//! Grounded in `original_source/src/runtime/lockfree/OFluxLockfreeRunTimeThread.h`'s
//! `RunTimeThread` (`_running`/`_request_stop`/`_asleep` trio, `wake()`,
//! `popLocal`/`pushLocal`/`steal`, `log_snapshot`), re-expressed with
//! `parking_lot::Condvar` for the park/wake pairing the way this crate's
//! teacher pairs `Condvar`+`Mutex` in `transaction::lock_manager`.

use crate::event::{Event, EventId};
use crate::scheduler::deque::{Steal, WorkStealingDeque};
use crate::scheduler::dispatch;
use crate::scheduler::Scheduler;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    /// The worker this OS thread is currently running as, if any. Used by
    /// [`Scheduler::submit`] to route cross-thread submissions to the
    /// caller's own deque when the caller is itself a worker, and by the
    /// shim interface (`crate::shim`) to answer `currently_detached()`.
    pub(crate) static CURRENT_WORKER: std::cell::RefCell<Option<Arc<WorkerHandle>>> =
        const { std::cell::RefCell::new(None) };
}

/// Per-worker state: its deque, its park/wake pairing, and the lifecycle
/// flags spec.md §4.2 describes as "running / requested-stop / asleep".
pub struct WorkerHandle {
    pub id: usize,
    pub(crate) deque: Arc<WorkStealingDeque<Arc<Event>>>,
    park_lock: Mutex<bool>,
    park_cond: Condvar,
    pub(crate) running: AtomicBool,
    pub(crate) asleep: AtomicBool,
    pub(crate) detached: AtomicBool,
    current_event: Mutex<Option<EventId>>,
    /// The OS thread's native id, recorded once the worker loop starts
    /// running on it -- `hard_kill` needs this to target a signal at a
    /// specific thread, since `std::thread::Thread` exposes no such id.
    #[cfg(unix)]
    native_tid: Mutex<Option<libc::pthread_t>>,
}

impl WorkerHandle {
    pub(crate) fn new(id: usize, queue_allowance: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            deque: Arc::new(WorkStealingDeque::with_capacity(queue_allowance)),
            park_lock: Mutex::new(false),
            park_cond: Condvar::new(),
            running: AtomicBool::new(true),
            asleep: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            current_event: Mutex::new(None),
            #[cfg(unix)]
            native_tid: Mutex::new(None),
        })
    }

    /// Record the calling OS thread's native id. Called once, from inside
    /// [`run`], before the worker enters its pop/steal/park loop.
    #[cfg(unix)]
    fn record_native_tid(&self) {
        *self.native_tid.lock() = Some(unsafe { libc::pthread_self() });
    }

    /// Best-effort: send `SIGUSR1` to this worker's OS thread so a
    /// blocking syscall it's parked in (observed through `crate::shim`)
    /// returns `EINTR`. A no-op handler is installed once per process by
    /// [`crate::scheduler::install_interrupt_handler`] so the signal
    /// doesn't terminate the process.
    #[cfg(unix)]
    pub(crate) fn send_interrupt(&self) {
        if let Some(tid) = *self.native_tid.lock() {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep.load(Ordering::Acquire)
    }

    pub fn current_event(&self) -> Option<EventId> {
        *self.current_event.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.deque.len()
    }

    /// Wait until woken or until `running` is cleared by `soft_kill`.
    /// Uses a persistent "signaled" flag under the park mutex rather than
    /// a bare condvar wait so a wake that races the park is never lost.
    fn park_until_woken(&self) {
        let mut signaled = self.park_lock.lock();
        self.asleep.store(true, Ordering::Release);
        while !*signaled && self.running.load(Ordering::Acquire) {
            self.park_cond.wait(&mut signaled);
        }
        *signaled = false;
        self.asleep.store(false, Ordering::Release);
    }

    pub(crate) fn wake(&self) {
        let mut signaled = self.park_lock.lock();
        *signaled = true;
        self.park_cond.notify_one();
    }
}

/// Runs one worker's whole lifetime on the calling OS thread: install the
/// thread-local handle, loop pop-local/steal/park until `soft_kill` (or
/// `hard_kill`) clears `running`, drain the local deque on the way out,
/// then clear the thread-local.
pub fn run(scheduler: Arc<Scheduler>, handle: Arc<WorkerHandle>) {
    CURRENT_WORKER.with(|c| *c.borrow_mut() = Some(handle.clone()));
    #[cfg(unix)]
    handle.record_native_tid();
    tracing::info!(worker = handle.id, "worker started");

    loop {
        if let Some(ev) = handle.deque.pop() {
            step(&scheduler, &handle, ev);
            continue;
        }
        if !handle.running.load(Ordering::Acquire) {
            break;
        }
        if let Some(ev) = steal_from_peers(&scheduler, &handle) {
            step(&scheduler, &handle, ev);
            continue;
        }
        if !handle.running.load(Ordering::Acquire) {
            break;
        }
        handle.park_until_woken();
    }

    // soft_kill was observed: drain whatever is still locally queued
    // before exiting, per spec.md §4.2's "each worker drains its deque,
    // then exits".
    while let Some(ev) = handle.deque.pop() {
        step(&scheduler, &handle, ev);
    }

    CURRENT_WORKER.with(|c| *c.borrow_mut() = None);
    tracing::info!(worker = handle.id, "worker exited");
}

/// Round-robin a randomly rotated pass over every peer's stealer,
/// retrying a peer that reports `Steal::Retry` a few times before moving
/// on, and treating `Steal::Empty` as "nothing there right now".
fn steal_from_peers(scheduler: &Arc<Scheduler>, handle: &Arc<WorkerHandle>) -> Option<Arc<Event>> {
    let peers = scheduler.peer_deques(handle.id);
    if peers.is_empty() {
        return None;
    }
    let start = rand::rng().random_range(0..peers.len());
    for offset in 0..peers.len() {
        let peer = &peers[(start + offset) % peers.len()];
        for _ in 0..4 {
            match peer.steal() {
                Steal::Success(ev) => return Some(ev),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

/// One `handle()` iteration (spec.md §4.2): run the node (inline, or
/// detached if the node and the runtime's detached budget both allow
/// it), dispatch its successors, and push what becomes runnable --
/// released waiters before newly created successors.
fn step(scheduler: &Arc<Scheduler>, handle: &Arc<WorkerHandle>, ev: Arc<Event>) {
    *handle.current_event.lock() = Some(ev.id);

    let flow = scheduler.current_flow();
    let node = flow.node(ev.node).clone();

    let result = if node.flags.is_detached && scheduler.try_enter_detached() {
        handle.detached.store(true, Ordering::Release);
        // Stepping out of the runnable pool for a blocking call would
        // otherwise starve the rest of the graph; wake a peer so
        // parallelism is preserved while this worker is tied up.
        scheduler.wake_one_other(handle.id);
        let r = (node.handler)(&ev.input);
        handle.detached.store(false, Ordering::Release);
        scheduler.leave_detached();
        r
    } else {
        (node.handler)(&ev.input)
    };

    let outcome = dispatch::dispatch(&scheduler.guard_table, &flow, &ev, result);

    for woken in outcome.released_waiters {
        handle.deque.push(woken);
    }
    for successor in outcome.ready_successors {
        handle.deque.push(successor);
    }

    *handle.current_event.lock() = None;
    scheduler.wake_one();
}

/// Diagnostic counter of how many workers are currently parked, used by
/// `RuntimeConfig::min_waiting_thread_collect` idle-collection sampling.
pub(crate) fn count_asleep(workers: &[Arc<WorkerHandle>]) -> usize {
    workers.iter().filter(|w| w.is_asleep()).count()
}

pub(crate) static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);
