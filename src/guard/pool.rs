//! Pool guard: handout of interchangeable resources.
//!
//! Free resources and parked waiters share one list behind a single head
//! pointer, so a single CAS atomically moves a resource to a waiter or a
//! waiter to the resource queue -- the two can never coexist in the
//! chain at once. `head` is always a placeholder (its own payload, if
//! any, has already been handed out); `head.next` carries whichever
//! content currently exists:
//!
//! | state | shape |
//! |---|---|
//! | resourcesN | `head.next` starts a chain of `Resource` nodes |
//! | empty | `head == tail`, `head.next == null` |
//! | waitingM | `head.next` starts a chain of `Waiter` nodes |
//!
//! This is the same placeholder-plus-chain shape
//! [`crate::guard::exclusive::ExclusiveGuard`] uses; the one difference
//! is which direction payload flows -- `acquire_or_wait` pops from the
//! front here, where Exclusive only ever pops on release.

use crate::concurrent::hazard::{retire, HazardGuard};
use crate::concurrent::Backoff;
use crate::event::{Event, PoolResource};
use crate::flow::AccessMode;
use crate::guard::{Guard, GuardId, GuardKind};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

enum NodeKind {
    /// Only ever used for the initial node of a pool with zero seed
    /// resources; immediately indistinguishable from a spent node.
    Sentinel,
    Resource(PoolResource),
    Waiter(Arc<Event>),
}

struct Node {
    next: AtomicPtr<Node>,
    kind: std::cell::UnsafeCell<NodeKind>,
}

// Safety: all access to `kind` is gated by a successful CAS on `head` or
// `tail`, which provides the happens-before edge a plain field can't.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    fn boxed(kind: NodeKind) -> *mut Node {
        Box::into_raw(Box::new(Node { next: AtomicPtr::new(ptr::null_mut()), kind: std::cell::UnsafeCell::new(kind) }))
    }
}

pub struct PoolGuard {
    id: GuardId,
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
}

impl PoolGuard {
    pub fn new<T: Send + Sync + 'static>(id: GuardId, resources: impl Iterator<Item = T>) -> Self {
        let head = Node::boxed(NodeKind::Sentinel);
        let resource_nodes: Vec<*mut Node> = resources
            .map(|r| Node::boxed(NodeKind::Resource(Box::new(r))))
            .collect();
        for w in resource_nodes.windows(2) {
            unsafe { &*w[0] }.next.store(w[1], Ordering::Relaxed);
        }
        let tail = match resource_nodes.last() {
            Some(&last) => {
                unsafe { &*head }.next.store(resource_nodes[0], Ordering::Relaxed);
                last
            }
            None => head,
        };
        Self { id, head: AtomicPtr::new(head), tail: AtomicPtr::new(tail) }
    }

    fn take_resource_from(&self, by: &Arc<Event>) -> PoolResource {
        let mut holder = by.atomics.lock();
        let idx = holder
            .entries
            .iter()
            .position(|e| e.guard_ref.guard_id == self.id)
            .expect("event released a pool guard it never acquired");
        holder.entries[idx].resource.take().expect("pool guard entry missing its resource")
    }

    /// MS-queue style enqueue starting from the current tail. Shared by
    /// appending a new waiter (acquire finds the pool empty) and
    /// returning a resource (release finds waiters or an existing
    /// resource chain).
    fn enqueue(&self, node: *mut Node) {
        let hazard = HazardGuard::new(ptr::null_mut::<Node>());
        let mut backoff = Backoff::new();
        loop {
            let t = self.tail.load(Ordering::Acquire);
            hazard.protect(t);
            if self.tail.load(Ordering::Acquire) != t {
                backoff.spin();
                continue;
            }
            let t_next = unsafe { &*t }.next.load(Ordering::Acquire);
            if t_next.is_null() {
                if unsafe { &*t }
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(t, node, Ordering::AcqRel, Ordering::Acquire);
                    return;
                }
            } else {
                let _ = self.tail.compare_exchange(t, t_next, Ordering::AcqRel, Ordering::Acquire);
            }
            backoff.spin();
        }
    }

    /// Number of resources currently sitting free in the chain.
    /// Diagnostics only -- racy under concurrent use.
    pub fn available(&self) -> usize {
        let hazard = HazardGuard::new(ptr::null_mut::<Node>());
        let mut count = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        hazard.protect(cur);
        loop {
            let next = unsafe { &*cur }.next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            if matches!(unsafe { &*(*next).kind.get() }, NodeKind::Resource(_)) {
                count += 1;
            } else {
                break;
            }
            cur = next;
            hazard.protect(cur);
        }
        count
    }

    /// Number of waiters currently parked in the chain. Diagnostics only.
    fn waiting(&self) -> usize {
        let hazard = HazardGuard::new(ptr::null_mut::<Node>());
        let mut count = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        hazard.protect(cur);
        loop {
            let next = unsafe { &*cur }.next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            if matches!(unsafe { &*(*next).kind.get() }, NodeKind::Waiter(_)) {
                count += 1;
            } else {
                break;
            }
            cur = next;
            hazard.protect(cur);
        }
        count
    }
}

impl Guard for PoolGuard {
    fn acquire_or_wait(&self, ev: Arc<Event>, _mode: AccessMode) -> bool {
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

            if h_next.is_null() {
                let node = Node::boxed(NodeKind::Waiter(ev.clone()));
                self.enqueue(node);
                debug_assert!(ev.mark_parked(), "double park");
                return false;
            }

            let is_resource = matches!(unsafe { &*(*h_next).kind.get() }, NodeKind::Resource(_));
            if is_resource {
                if self
                    .head
                    .compare_exchange(h, h_next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let resource = unsafe {
                        match std::ptr::replace((*h_next).kind.get(), NodeKind::Sentinel) {
                            NodeKind::Resource(r) => r,
                            _ => unreachable!("checked Resource above"),
                        }
                    };
                    let idx = ev.atomics.lock().working_on;
                    ev.atomics.lock().stash_resource(idx, resource);
                    retire(h);
                    return true;
                }
                backoff.spin();
                continue;
            }

            // Resources are exhausted and waiters already queued; join them.
            let node = Node::boxed(NodeKind::Waiter(ev.clone()));
            self.enqueue(node);
            debug_assert!(ev.mark_parked(), "double park");
            return false;
        }
    }

    fn release(&self, by: &Arc<Event>) -> Vec<Arc<Event>> {
        let resource = self.take_resource_from(by);
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

            if h_next.is_null() || !is_waiter_node(h_next) {
                // empty or resourcesN: hand the resource back to the pool.
                let node = Node::boxed(NodeKind::Resource(resource));
                self.enqueue(node);
                return Vec::new();
            }

            // waitingM: hand the resource straight to the oldest waiter.
            if self
                .head
                .compare_exchange(h, h_next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let woken = unsafe {
                    match std::ptr::replace((*h_next).kind.get(), NodeKind::Sentinel) {
                        NodeKind::Waiter(e) => e,
                        _ => unreachable!("checked Waiter above"),
                    }
                };
                let idx = woken.atomics.lock().working_on;
                woken.atomics.lock().stash_resource(idx, resource);
                woken.clear_parked();
                retire(h);
                return vec![woken];
            }
            // Lost the race; the resource is still ours to place, retry.
            let _ = &resource;
            backoff.spin();
        }
    }

    fn kind(&self) -> GuardKind {
        GuardKind::Pool
    }

    fn describe(&self) -> String {
        let available = self.available();
        if available > 0 {
            return format!("resources{available}");
        }
        let waiting = self.waiting();
        if waiting > 0 {
            format!("waiting{waiting}")
        } else {
            "empty".to_string()
        }
    }
}

fn is_waiter_node(node: *mut Node) -> bool {
    matches!(unsafe { &*(*node).kind.get() }, NodeKind::Waiter(_))
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        loop {
            let next = unsafe { &*cur }.next.load(Ordering::Relaxed);
            unsafe { drop(Box::from_raw(cur)) };
            if next.is_null() {
                break;
            }
            cur = next;
        }
    }
}
