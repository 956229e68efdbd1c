//! ReadWrite guard: readers/writers atom with an upgradable mode and
//! waiter fairness.
//!
//! Two representations share the same waiter chain shape as
//! [`crate::guard::exclusive::ExclusiveGuard`]:
//!
//! - *counter mode*, used whenever the waiter chain is empty (`head ==
//!   tail`): a signed counter, positive for N concurrent readers, `-1`
//!   for a single writer, `0` free.
//! - *queue mode*, used the instant any acquirer must wait: further
//!   arrivals always enqueue at the tail regardless of mode, which is
//!   what keeps a queued Write from being skipped by later Reads.
//!
//! `Upgradeable` resolves to `Read` if the guarded value has already been
//! initialized, `Write` otherwise -- preserved exactly as documented
//! even though it can hand Upgradeable a Write grant on non-null data
//! under a concurrent writer; see the module-level open question this
//! carries forward.

use crate::concurrent::hazard::{retire, HazardGuard};
use crate::concurrent::Backoff;
use crate::event::Event;
use crate::flow::AccessMode;
use crate::guard::{Guard, GuardKind};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

fn empty_marker<T>() -> *mut T {
    0x1 as *mut T
}

struct Node {
    next: AtomicPtr<Node>,
    event: Option<Arc<Event>>,
    mode: AccessMode,
}

impl Node {
    fn placeholder() -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(empty_marker()),
            event: None,
            mode: AccessMode::Read,
        }))
    }

    fn waiter(ev: Arc<Event>, mode: AccessMode) -> *mut Node {
        Box::into_raw(Box::new(Node { next: AtomicPtr::new(ptr::null_mut()), event: Some(ev), mode }))
    }
}

pub struct ReadWriteGuard {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    /// `0` free, `>0` readers holding, `-1` a writer holding. Only
    /// meaningful while `head == tail`.
    rcount: AtomicI64,
    /// Backs the Upgradeable resolution rule: "Read iff the value is
    /// already non-null".
    data_initialized: AtomicBool,
}

impl ReadWriteGuard {
    pub fn new() -> Self {
        let sentinel = Node::placeholder();
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            rcount: AtomicI64::new(0),
            data_initialized: AtomicBool::new(false),
        }
    }

    /// Mark the guarded value as initialized, changing how future
    /// `Upgradeable` acquires resolve.
    pub fn mark_data_initialized(&self) {
        self.data_initialized.store(true, Ordering::Release);
    }

    pub fn is_data_initialized(&self) -> bool {
        self.data_initialized.load(Ordering::Acquire)
    }

    fn resolve(&self, mode: AccessMode) -> AccessMode {
        match mode {
            // Tolerated rather than fixed: an Upgradeable acquirer can
            // race a concurrent writer that nulls the value between this
            // check and the writer's own acquisition, and end up with
            // Write access to what the caller will treat as read-only
            // data. NULL data is never handed out for Read.
            AccessMode::Upgradeable => {
                if self.data_initialized.load(Ordering::Acquire) {
                    AccessMode::Read
                } else {
                    AccessMode::Write
                }
            }
            other => other,
        }
    }

    /// Current reader/writer count for diagnostics: positive N readers,
    /// `-1` a writer, `0` free or queued-only.
    pub fn rcount(&self) -> i64 {
        self.rcount.load(Ordering::Acquire)
    }

    pub fn has_waiters(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }
}

impl Default for ReadWriteGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Guard for ReadWriteGuard {
    fn acquire_or_wait(&self, ev: Arc<Event>, mode: AccessMode) -> bool {
        let local_mode = self.resolve(mode);
        let hazard = HazardGuard::new(ptr::null_mut::<Node>());
        let mut backoff = Backoff::new();
        loop {
            let h = self.head.load(Ordering::Acquire);
            hazard.protect(h);
            if self.head.load(Ordering::Acquire) != h {
                backoff.spin();
                continue;
            }
            let t = self.tail.load(Ordering::Acquire);

            if h == t {
                // No queue: try the counter fast path.
                let cur = self.rcount.load(Ordering::Acquire);
                let fast = match local_mode {
                    AccessMode::Write => cur == 0,
                    _ => cur >= 0,
                };
                if fast {
                    let want = if local_mode == AccessMode::Write { -1 } else { cur + 1 };
                    if self.rcount.compare_exchange(cur, want, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                        return true;
                    }
                    backoff.spin();
                    continue;
                }

                // Must queue: flip head.next from the empty marker to a
                // real waiter node, entering queue mode.
                let node = Node::waiter(ev.clone(), local_mode);
                if unsafe { &*h }
                    .next
                    .compare_exchange(empty_marker(), node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(h, node, Ordering::AcqRel, Ordering::Acquire);
                    debug_assert!(ev.mark_parked(), "double park");
                    return false;
                }
                unsafe { drop(Box::from_raw(node)) };
                backoff.spin();
                continue;
            }

            // Queue mode: a Write already queued (or queued before us)
            // must not be skipped, so every arrival enqueues at the tail.
            let t_next = unsafe { &*t }.next.load(Ordering::Acquire);
            if t != self.tail.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }
            if t_next.is_null() {
                let node = Node::waiter(ev.clone(), local_mode);
                if unsafe { &*t }
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(t, node, Ordering::AcqRel, Ordering::Acquire);
                    debug_assert!(ev.mark_parked(), "double park");
                    return false;
                }
                unsafe { drop(Box::from_raw(node)) };
            } else {
                let _ = self.tail.compare_exchange(t, t_next, Ordering::AcqRel, Ordering::Acquire);
            }
            backoff.spin();
        }
    }

    fn release(&self, _by: &Arc<Event>) -> Vec<Arc<Event>> {
        let mut backoff = Backoff::new();
        loop {
            let cur = self.rcount.load(Ordering::Acquire);
            debug_assert!(cur != 0, "release called on a guard with no holder");
            let next = if cur == -1 { 0 } else { cur - 1 };
            if self.rcount.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire).is_err() {
                backoff.spin();
                continue;
            }
            if next != 0 {
                // Other readers are still holding; nothing to admit yet.
                return Vec::new();
            }
            return self.pop_waiter_group();
        }
    }

    fn kind(&self) -> GuardKind {
        GuardKind::ReadWrite
    }

    fn describe(&self) -> String {
        let rcount = self.rcount();
        if self.has_waiters() {
            format!("waiting (rcount={rcount})")
        } else if rcount == 0 {
            "empty".to_string()
        } else if rcount < 0 {
            "held_write".to_string()
        } else {
            format!("held_read{rcount}")
        }
    }
}

impl ReadWriteGuard {
    /// Pop the longest prefix of the waiter chain compatible with a
    /// single new mode: every consecutive Read forms one group, a single
    /// Write is its own group. Grants the popped group and returns their
    /// events. FIFO is preserved -- a Write already at the head is never
    /// skipped to admit later Reads.
    fn pop_waiter_group(&self) -> Vec<Arc<Event>> {
        let hazard = HazardGuard::new(ptr::null_mut::<Node>());
        let mut backoff = Backoff::new();
        loop {
            let h = self.head.load(Ordering::Acquire);
            hazard.protect(h);
            if self.head.load(Ordering::Acquire) != h {
                backoff.spin();
                continue;
            }
            let h_next = unsafe { &*h }.next.load(Ordering::Acquire);
            if h_next.is_null() || h_next == empty_marker() {
                // Nothing queued.
                return Vec::new();
            }

            let first_mode = unsafe { &*h_next }.mode;
            let mut nodes = vec![h_next];
            if first_mode != AccessMode::Write {
                let mut cur = h_next;
                loop {
                    let n = unsafe { &*cur }.next.load(Ordering::Acquire);
                    if n.is_null() {
                        break;
                    }
                    if unsafe { &*n }.mode == AccessMode::Write {
                        break;
                    }
                    nodes.push(n);
                    cur = n;
                }
            }
            let last = *nodes.last().expect("at least one waiter node collected");

            if self
                .head
                .compare_exchange(h, last, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            let mut woken = Vec::with_capacity(nodes.len());
            for &n in &nodes {
                let ev = unsafe { &mut *n }.event.take().expect("waiter node missing its event");
                ev.clear_parked();
                woken.push(ev);
            }
            self.rcount.store(
                if first_mode == AccessMode::Write { -1 } else { nodes.len() as i64 },
                Ordering::Release,
            );
            for &n in &nodes[..nodes.len() - 1] {
                retire(n);
            }
            retire(h);
            return woken;
        }
    }
}

impl Drop for ReadWriteGuard {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        loop {
            let next = unsafe { &*cur }.next.load(Ordering::Relaxed);
            unsafe { drop(Box::from_raw(cur)) };
            if next.is_null() || next == empty_marker() {
                break;
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev() -> Arc<Event> {
        Event::new(0, vec![], None, 0)
    }

    #[test]
    fn multiple_readers_share_the_guard() {
        let g = ReadWriteGuard::new();
        assert!(g.acquire_or_wait(ev(), AccessMode::Read));
        assert!(g.acquire_or_wait(ev(), AccessMode::Read));
        assert_eq!(g.rcount(), 2);
    }

    #[test]
    fn writer_excludes_readers() {
        let g = ReadWriteGuard::new();
        let w = ev();
        assert!(g.acquire_or_wait(w.clone(), AccessMode::Write));
        assert_eq!(g.rcount(), -1);
        let r = ev();
        assert!(!g.acquire_or_wait(r.clone(), AccessMode::Write));
        assert!(r.is_parked());
    }

    #[test]
    fn queued_writer_is_not_skipped_by_later_readers() {
        let g = ReadWriteGuard::new();
        let w0 = ev();
        assert!(g.acquire_or_wait(w0.clone(), AccessMode::Write));

        let w1 = ev();
        assert!(!g.acquire_or_wait(w1.clone(), AccessMode::Write));
        let r1 = ev();
        assert!(!g.acquire_or_wait(r1.clone(), AccessMode::Read));

        let woken = g.release(&w0);
        assert_eq!(woken.len(), 1);
        assert!(Arc::ptr_eq(&woken[0], &w1));
        assert_eq!(g.rcount(), -1);
        assert!(r1.is_parked());
    }

    #[test]
    fn release_admits_a_group_of_consecutive_readers() {
        let g = ReadWriteGuard::new();
        let w0 = ev();
        assert!(g.acquire_or_wait(w0.clone(), AccessMode::Write));

        let r1 = ev();
        let r2 = ev();
        let w2 = ev();
        assert!(!g.acquire_or_wait(r1.clone(), AccessMode::Read));
        assert!(!g.acquire_or_wait(r2.clone(), AccessMode::Read));
        assert!(!g.acquire_or_wait(w2.clone(), AccessMode::Write));

        let woken = g.release(&w0);
        assert_eq!(woken.len(), 2);
        assert_eq!(g.rcount(), 2);
        assert!(w2.is_parked());
    }

    #[test]
    fn upgradeable_resolves_at_acquire_time() {
        // Documented open question: Upgradeable resolves against the
        // data's initialized-ness at acquire time, not continuously. A
        // guard created with no data yet resolves Upgradeable to Write.
        let g = ReadWriteGuard::new();
        let e1 = ev();
        assert!(g.acquire_or_wait(e1.clone(), AccessMode::Upgradeable));
        assert_eq!(g.rcount(), -1, "Upgradeable on uninitialized data resolves to Write");
        g.release(&e1);

        g.mark_data_initialized();
        let e2 = ev();
        assert!(g.acquire_or_wait(e2.clone(), AccessMode::Upgradeable));
        assert_eq!(g.rcount(), 1, "Upgradeable on initialized data resolves to Read");
    }
}
