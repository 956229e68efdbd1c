//! Scenario 3 (pool handout) from the end-to-end list: a pool guard
//! seeded with 3 resources and 5 concurrent acquirers.

use oflux::event::Event;
use oflux::flow::{AccessMode, GuardReference};
use oflux::guard::GuardTable;
use std::sync::Arc;

fn seed(ev: &Arc<Event>, guard_id: oflux::guard::GuardId) {
    ev.atomics.lock().set_guards(vec![GuardReference {
        guard_id,
        mode: AccessMode::Exclusive,
        late: false,
        late_resolver: None,
        magic_number: 0,
    }]);
}

fn peek_resource(ev: &Arc<Event>) -> &'static str {
    let holder = ev.atomics.lock();
    *holder.entries[0]
        .resource
        .as_ref()
        .expect("acquirer must hold a resource")
        .downcast_ref::<&'static str>()
        .unwrap()
}

#[test]
fn first_three_acquire_synchronously_last_two_park_then_drain_in_order() {
    let table = GuardTable::new();
    let id = table.create_pool("p", vec!["a", "b", "c"].into_iter());
    let guard = table.get(id).unwrap();

    let events: Vec<_> = (0..5)
        .map(|_| {
            let e = Event::new(0, vec![], None, 1);
            seed(&e, id);
            e
        })
        .collect();

    let mut acquired_immediately = Vec::new();
    let mut parked = Vec::new();
    for e in &events {
        if guard.acquire_or_wait(e.clone(), AccessMode::Exclusive) {
            acquired_immediately.push(e.clone());
        } else {
            parked.push(e.clone());
        }
    }

    assert_eq!(acquired_immediately.len(), 3, "exactly N of N+K acquire synchronously");
    assert_eq!(parked.len(), 2, "the rest park");
    assert!(parked.iter().all(|e| e.is_parked()));

    let mut resources_seen = vec![peek_resource(&acquired_immediately[0]), peek_resource(&acquired_immediately[1]), peek_resource(&acquired_immediately[2])];

    let mut remaining_parked = parked;
    for holder in &acquired_immediately {
        let woken = guard.release(holder);
        if let Some(next_waiter) = remaining_parked.first().cloned() {
            assert_eq!(woken.len(), 1, "exactly one parked event wakes per release while waiters remain");
            assert!(Arc::ptr_eq(&woken[0], &next_waiter));
            assert!(!woken[0].is_parked());
            resources_seen.push(peek_resource(&woken[0]));
            remaining_parked.remove(0);
        } else {
            assert!(woken.is_empty(), "a release with no waiters returns nothing, resource goes back to the pool");
        }
    }

    assert!(remaining_parked.is_empty(), "every waiter was eventually woken");
    resources_seen.sort_unstable();
    assert_eq!(resources_seen, vec!["a", "a", "b", "b", "c"], "each of {{a,b,c}} handed out, and re-handed to the two waiters");
}
