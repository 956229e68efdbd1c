//! End-to-end scenarios, run through the real `Scheduler` (worker
//! threads, work-stealing, dispatch) rather than any single component in
//! isolation.
//!
//! Scenarios 2 (read/write fairness) and 3 (pool handout) are covered at
//! the guard level in `tests/guard_rwlock.rs` and `tests/guard_pool.rs`;
//! scenario 5 (splayed output + source cap) has a dedicated regression
//! test in `src/scheduler/dispatch.rs`'s own unit tests, where it can
//! assert on `DispatchOutcome` directly without the scheduler's own
//! startup seeding of source nodes complicating the count. What's below
//! exercises scenarios 1, 4, and 6 through the full scheduler.

use oflux::config::RuntimeConfig;
use oflux::flow::loader::{guard_ref, FlowBuilder};
use oflux::flow::{AccessMode, Case, Condition, NodeFlags, NodeResult};
use oflux::guard::{GuardKind, GuardTable};
use oflux::scheduler::Scheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

/// Scenario 1: two self-looping sources contending on one exclusive
/// guard, run for a bounded number of cycles each (scaled down from the
/// spec's 10,000 for test speed; the invariant under test -- mutual
/// exclusion -- does not depend on the cycle count).
#[test]
fn exclusive_sequencing_never_overlaps() {
    const TARGET_PER_SOURCE: usize = 300;

    let table = Arc::new(GuardTable::new());
    let mut builder = FlowBuilder::new();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let s1_total = Arc::new(AtomicUsize::new(0));
    let s2_total = Arc::new(AtomicUsize::new(0));

    let make_handler = |total: Arc<AtomicUsize>| {
        let concurrent = concurrent.clone();
        let max_seen = max_seen.clone();
        Arc::new(move |_: &[u8]| {
            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            concurrent.fetch_sub(1, Ordering::SeqCst);
            let t = total.fetch_add(1, Ordering::SeqCst) + 1;
            let keep_going = if t < TARGET_PER_SOURCE { 1u8 } else { 0u8 };
            NodeResult::ok(vec![vec![keep_going]])
        })
    };

    let s1 = builder
        .add_node("s1", NodeFlags { is_source: true, ..Default::default() }, make_handler(s1_total.clone()))
        .unwrap();
    let s2 = builder
        .add_node("s2", NodeFlags { is_source: true, ..Default::default() }, make_handler(s2_total.clone()))
        .unwrap();

    let guard = guard_ref(&table, "g", GuardKind::Exclusive, AccessMode::Exclusive);
    builder.set_guards(s1, vec![guard.clone()]);
    builder.set_guards(s2, vec![guard]);

    let continues = || Case { target: 0, conditions: vec![Condition { argument_position: 0, negated: false, predicate: Arc::new(|out: &[u8]| out.first() == Some(&1)) }] };
    builder.set_cases(s1, vec![Case { target: s1, ..continues() }]);
    builder.set_cases(s2, vec![Case { target: s2, ..continues() }]);

    builder.check_acyclic(&table).unwrap();
    let flow = builder.build();

    let config = RuntimeConfig { initial_thread_pool_size: 4, ..RuntimeConfig::default() };
    let scheduler = Scheduler::new(config, flow, table);
    scheduler.start();

    let done = wait_until(
        || s1_total.load(Ordering::SeqCst) >= TARGET_PER_SOURCE && s2_total.load(Ordering::SeqCst) >= TARGET_PER_SOURCE,
        Duration::from_secs(10),
    );
    scheduler.soft_kill();
    scheduler.join();

    assert!(done, "both sources should reach their target cycle count");
    assert_eq!(max_seen.load(Ordering::SeqCst), 1, "the exclusive guard must never admit both sources at once");
}

/// Scenario 4: a node that always errors routes to its declared error
/// handler with the original error code and input, and the handler's own
/// successors fire normally afterward.
#[test]
fn error_routing_reaches_the_handler_with_original_payload() {
    let table = Arc::new(GuardTable::new());
    let mut builder = FlowBuilder::new();

    let handler_hits = Arc::new(AtomicUsize::new(0));
    let handler_saw_input = Arc::new(std::sync::Mutex::new(Vec::new()));
    let after_hits = Arc::new(AtomicUsize::new(0));

    let n = builder
        .add_node(
            "n",
            NodeFlags { is_initial: true, ..Default::default() },
            Arc::new(|_: &[u8]| NodeResult::err(7)),
        )
        .unwrap();

    let after = {
        let after_hits = after_hits.clone();
        builder
            .add_node(
                "after",
                NodeFlags::default(),
                Arc::new(move |_: &[u8]| {
                    after_hits.fetch_add(1, Ordering::SeqCst);
                    NodeResult::ok(vec![])
                }),
            )
            .unwrap()
    };

    let eh = {
        let handler_hits = handler_hits.clone();
        let handler_saw_input = handler_saw_input.clone();
        builder
            .add_node(
                "eh",
                NodeFlags { is_error_handler: true, ..Default::default() },
                Arc::new(move |input: &[u8]| {
                    handler_hits.fetch_add(1, Ordering::SeqCst);
                    *handler_saw_input.lock().unwrap() = input.to_vec();
                    NodeResult::ok(vec![b"handled".to_vec()])
                }),
            )
            .unwrap()
    };
    builder.set_error_handler(n, eh);
    builder.set_cases(
        eh,
        vec![Case { target: after, conditions: vec![Condition { argument_position: 0, negated: false, predicate: Arc::new(|_| true) }] }],
    );

    builder.check_acyclic(&table).unwrap();
    let flow = builder.build();

    let config = RuntimeConfig { initial_thread_pool_size: 2, ..RuntimeConfig::default() };
    let scheduler = Scheduler::new(config, flow, table);
    scheduler.start();

    let done = wait_until(|| after_hits.load(Ordering::SeqCst) >= 1, Duration::from_secs(5));
    scheduler.soft_kill();
    scheduler.join();

    assert!(done);
    assert_eq!(handler_hits.load(Ordering::SeqCst), 1, "error handler runs exactly once");
    assert!(handler_saw_input.lock().unwrap().is_empty(), "the initial node's input was empty bytes");
}

/// Scenario 6: reload mid-flight. Start scenario 1's flow with a single
/// guard G, let it run for a while, then reload a flow where S1 also
/// requires a second guard H. Subsequent S1 events must acquire both in
/// magic-number order and no events already in flight are lost.
#[test]
fn reload_swaps_the_flow_without_losing_in_flight_events() {
    let table = Arc::new(GuardTable::new());
    let mut builder = FlowBuilder::new();

    let s1_total = Arc::new(AtomicUsize::new(0));
    let handler = {
        let s1_total = s1_total.clone();
        Arc::new(move |_: &[u8]| {
            s1_total.fetch_add(1, Ordering::SeqCst);
            NodeResult::ok(vec![vec![1u8]])
        })
    };
    let s1 = builder.add_node("s1", NodeFlags { is_source: true, ..Default::default() }, handler).unwrap();
    let g = guard_ref(&table, "g", GuardKind::Exclusive, AccessMode::Exclusive);
    builder.set_guards(s1, vec![g.clone()]);
    builder.set_cases(
        s1,
        vec![Case { target: s1, conditions: vec![Condition { argument_position: 0, negated: false, predicate: Arc::new(|_| true) }] }],
    );
    builder.check_acyclic(&table).unwrap();
    let flow = builder.build();

    let config = RuntimeConfig { initial_thread_pool_size: 2, ..RuntimeConfig::default() };
    let scheduler = Scheduler::new(config, flow, table.clone());
    scheduler.start();

    assert!(wait_until(|| s1_total.load(Ordering::SeqCst) >= 10, Duration::from_secs(5)));
    let count_before_reload = s1_total.load(Ordering::SeqCst);

    // Build a second flow where s1 also requires guard H, at a higher
    // magic number than G so acquisition order stays ascending.
    let mut builder2 = FlowBuilder::new();
    let handler2 = {
        let s1_total = s1_total.clone();
        Arc::new(move |_: &[u8]| {
            s1_total.fetch_add(1, Ordering::SeqCst);
            NodeResult::ok(vec![vec![1u8]])
        })
    };
    let s1_v2 = builder2.add_node("s1", NodeFlags { is_source: true, ..Default::default() }, handler2).unwrap();
    let h = guard_ref(&table, "h", GuardKind::Exclusive, AccessMode::Exclusive);
    builder2.set_guards(s1_v2, vec![g, h]);
    builder2.set_cases(
        s1_v2,
        vec![Case { target: s1_v2, conditions: vec![Condition { argument_position: 0, negated: false, predicate: Arc::new(|_| true) }] }],
    );
    builder2.check_acyclic(&table).unwrap();
    let flow2 = builder2.build();

    scheduler.reload(flow2);

    assert!(wait_until(|| s1_total.load(Ordering::SeqCst) >= count_before_reload + 10, Duration::from_secs(5)));
    let final_flow = scheduler.current_flow();
    assert_eq!(final_flow.node(0).guards.len(), 2, "the reloaded flow's s1 now requires two guards");
    assert!(
        final_flow.node(0).guards[0].magic_number < final_flow.node(0).guards[1].magic_number,
        "guards stay in ascending magic-number order after reload"
    );

    scheduler.soft_kill();
    scheduler.join();
}
