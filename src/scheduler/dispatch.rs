//! Successor dispatch (spec §4.7): given a completed event, decide which
//! successor events exist, attempt to acquire their guards, and collect
//! whatever becomes runnable as a result of releasing the completed
//! event's own guards.
//!
//! Nothing here touches a deque or a worker directly -- [`dispatch`]
//! returns the two event lists a worker must push, in the priority order
//! spec.md §4.2 step 5 requires: waiters released by freeing this event's
//! guards first, then the newly created successors that acquired
//! synchronously.

use crate::atomics_holder::{acquire_all_or_wait, resume_after_release};
use crate::event::Event;
use crate::flow::{Flow, NodeId, NodeResult};
use crate::guard::GuardTable;
use std::sync::Arc;

/// What a worker should push back onto its deque after dispatching one
/// completed event, and in what order.
pub struct DispatchOutcome {
    /// Waiters freed by releasing the completed event's own guards.
    /// Pushed ahead of `ready_successors` so a thread that just freed a
    /// resource preferentially lets the next holder run next.
    pub released_waiters: Vec<Arc<Event>>,
    /// Newly created successor events that acquired their full guard set
    /// synchronously. Events that parked are *not* included here -- they
    /// already live inside a guard's waiter chain and will surface again
    /// as a `released_waiters` entry on some future release.
    pub ready_successors: Vec<Arc<Event>>,
}

/// Dispatch `ev`'s completion. `result` is whatever the node handler
/// returned; `ev`'s error code is updated from it before successors are
/// computed.
pub fn dispatch(table: &GuardTable, flow: &Flow, ev: &Arc<Event>, result: NodeResult) -> DispatchOutcome {
    let node = flow.node(ev.node);
    let mut successor_inputs: Vec<(NodeId, Vec<u8>)> = Vec::new();

    // Per spec.md §9 (preserved open question): "only one source
    // successor per splayed output" is a per-dispatch-step flag, not a
    // global one and not scoped to a single output -- a node that
    // splays several outputs, each of which could fire a case routing
    // to the same source, still emits that source exactly once per
    // execution of this node.
    let mut source_emitted = false;

    if result.is_error() {
        ev.set_error_code(result.error_code);
        // On error, cases are discarded entirely in favor of the
        // error-handler edge (if any) plus the source self-loop.
        if let Some(handler) = node.error_handler {
            successor_inputs.push((handler, ev.input.clone()));
        }
        // Preserved open question: the source self-loop re-emits even on
        // error, for every non-initial source, regardless of whether an
        // error handler also fired this step.
        if let Some(self_id) = node.source_self_edge(ev.node) {
            if !node.flags.is_initial {
                successor_inputs.push((self_id, ev.input.clone()));
                source_emitted = true;
            }
        }
    } else {
        for output in &result.outputs {
            for case in &node.cases {
                if !case.fires(output) {
                    continue;
                }
                if flow.node(case.target).flags.is_source {
                    if source_emitted {
                        continue;
                    }
                    source_emitted = true;
                }
                successor_inputs.push((case.target, output.clone()));
            }
        }
    }

    let mut ready_successors = Vec::new();
    for (target, input) in successor_inputs {
        let target_node = flow.node(target);
        let successor = Event::new(target, input, Some(ev.clone()), target_node.guards.len());
        successor.atomics.lock().set_guards(target_node.guards.clone());
        if acquire_all_or_wait(table, &successor) {
            ready_successors.push(successor);
        }
    }

    let released_waiters = release_own_guards(table, ev);
    ev.release();

    DispatchOutcome { released_waiters, ready_successors }
}

/// Release every guard `ev` holds, resuming each woken waiter's own
/// acquisition from the index it was parked at. A waiter only becomes
/// runnable here once it has acquired every guard after the one it was
/// released from -- one release can cascade through several already-free
/// guards before a waiter is actually ready.
fn release_own_guards(table: &GuardTable, ev: &Arc<Event>) -> Vec<Arc<Event>> {
    let acquired_guard_ids: Vec<_> = {
        let holder = ev.atomics.lock();
        holder
            .entries
            .iter()
            .filter(|e| e.acquired)
            .map(|e| e.guard_ref.resolve(&ev.input))
            .collect()
    };

    let mut released_waiters = Vec::new();
    for guard_id in acquired_guard_ids {
        let Some(guard) = table.get(guard_id) else { continue };
        for woken in guard.release(ev) {
            let parked_at = woken.atomics.lock().working_on;
            if resume_after_release(table, &woken, parked_at) {
                released_waiters.push(woken);
            }
        }
    }
    released_waiters
}
