//! Interface an external blocking-syscall interposer drives (spec §6).
//!
//! Node code that wraps a blocking syscall (a real socket read, a disk
//! fsync) calls through this shim so the runtime can keep other workers
//! available while the calling thread is stuck: `wait_to_run()` before
//! the blocking call, `wake_another_thread()` as it's about to block.
//! Nothing here touches the blocking call itself -- that's the
//! interposer's job, wherever it's compiled in.

use crate::scheduler::worker::CURRENT_WORKER;
use crate::scheduler::Scheduler;
use std::sync::Arc;

/// Diagnostic state of a worker thread, as surfaced through [`thread()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Running a node handler inline.
    Running,
    /// Stepped out of the runnable pool for a detached blocking call.
    Detached,
    /// Parked on its condition variable with nothing to steal.
    Parked,
}

/// Opaque handle to the calling thread's worker, or `None` if the
/// calling thread is not a scheduler worker at all (e.g. the thread that
/// built the flow and called `Scheduler::start`).
pub struct ThreadHandle {
    pub id: usize,
    pub wait_state: WaitState,
}

/// `true` iff the calling thread is currently a detached worker.
pub fn currently_detached() -> bool {
    CURRENT_WORKER.with(|c| c.borrow().as_ref().map(|h| h.is_detached()).unwrap_or(false))
}

/// The calling thread's opaque handle, if it is a scheduler worker.
pub fn thread() -> Option<ThreadHandle> {
    CURRENT_WORKER.with(|c| {
        let borrow = c.borrow();
        let handle = borrow.as_ref()?;
        let wait_state = if handle.is_detached() {
            WaitState::Detached
        } else if handle.is_asleep() {
            WaitState::Parked
        } else {
            WaitState::Running
        };
        Some(ThreadHandle { id: handle.id, wait_state })
    })
}

/// Call immediately before a node hands off to a blocking syscall.
/// Wakes one parked peer so the blocking call doesn't stall the rest of
/// the graph; a no-op if the calling thread isn't a worker (the
/// interposer should only be active inside node handlers).
pub fn wake_another_thread(scheduler: &Arc<Scheduler>) {
    if let Some(handle) = thread() {
        scheduler.wake_one_other(handle.id);
    }
}

/// Call immediately after a blocking syscall returns, before resuming
/// node logic. Present for symmetry with the external interposer's
/// around-the-syscall pairing; the scheduler has no separate wait queue
/// for returning-from-blocking workers; a woken worker simply resumes
/// stealing on its next loop iteration.
pub fn wait_to_run() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_worker_thread_reports_not_detached() {
        assert!(!currently_detached());
        assert!(thread().is_none());
    }
}
