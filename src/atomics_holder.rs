//! Acquire-all-or-wait: the protocol that makes multi-guard acquisition
//! deadlock-free.
//!
//! An event acquires its guards in strictly ascending magic-number order
//! and, if it must park on guard `i`, holds every guard before `i` and
//! none after. Because every event referencing the same guard subset
//! walks the same order, no cycle can form among wait edges -- this is
//! enforced by construction, not detected at runtime.

use crate::event::{Event, PoolResource};
use crate::flow::{AccessMode, GuardReference};
use crate::guard::{GuardId, GuardTable};
use std::sync::Arc;

/// One guard this event has been asked to hold: the reference from the
/// flow, the mode actually granted (Upgradeable resolves to Read/Write at
/// acquire time), whether it has been acquired yet, and -- for Pool
/// guards -- the resource handed back.
pub struct HeldAtomic {
    pub guard_ref: GuardReference,
    pub actual_mode: AccessMode,
    pub acquired: bool,
    pub resource: Option<PoolResource>,
}

/// Per-event bag of guard acquisitions, in ascending magic-number order.
/// `working_on` is the index of the next guard to attempt; everything
/// before it is already held.
pub struct AtomicsHolder {
    pub entries: Vec<HeldAtomic>,
    pub working_on: usize,
}

impl AtomicsHolder {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), working_on: 0 }
    }

    pub fn set_guards(&mut self, guards: Vec<GuardReference>) {
        debug_assert!(
            guards.windows(2).all(|w| w[0].magic_number <= w[1].magic_number),
            "guard references must be pre-sorted by magic number"
        );
        self.entries = guards
            .into_iter()
            .map(|guard_ref| HeldAtomic {
                actual_mode: guard_ref.mode,
                guard_ref,
                acquired: false,
                resource: None,
            })
            .collect();
        self.working_on = 0;
    }

    pub fn is_complete(&self) -> bool {
        self.working_on >= self.entries.len()
    }

    pub fn stash_resource(&mut self, index: usize, resource: PoolResource) {
        self.entries[index].resource = Some(resource);
    }
}

/// Drive `ev`'s acquisition forward from its current `working_on` cursor.
/// Returns `true` once every guard is held. On a park, the event has
/// already been appended to guard `working_on`'s waiter chain by the time
/// this returns `false`.
pub fn acquire_all_or_wait(table: &GuardTable, ev: &Arc<Event>) -> bool {
    loop {
        let (guard_id, mode, i) = {
            let holder = ev.atomics.lock();
            let i = holder.working_on;
            if i >= holder.entries.len() {
                return true;
            }
            let entry = &holder.entries[i];
            // Late guard references resolve their key from this event's
            // own input (the producing node's output) rather than the
            // statically assigned id; see `GuardReference::resolve`.
            (entry.guard_ref.resolve(&ev.input), entry.actual_mode, i)
        };

        let guard = table
            .get(guard_id)
            .expect("guard referenced by flow must be registered in the table");

        if guard.acquire_or_wait(ev.clone(), mode) {
            let mut holder = ev.atomics.lock();
            holder.entries[i].acquired = true;
            holder.working_on = i + 1;
            continue;
        } else {
            // ev was appended to guard_id's waiter chain inside
            // acquire_or_wait; working_on stays at i so a future resume
            // continues the loop at i+1 once released.
            return false;
        }
    }
}

/// Resume an event released from guard index `released_from`, continuing
/// acquisition at `released_from + 1`.
pub fn resume_after_release(table: &GuardTable, ev: &Arc<Event>, released_from: usize) -> bool {
    {
        let mut holder = ev.atomics.lock();
        debug_assert_eq!(holder.working_on, released_from);
        holder.entries[released_from].acquired = true;
        holder.working_on = released_from + 1;
    }
    acquire_all_or_wait(table, ev)
}
