//! Demo binary: builds a tiny flow by hand and runs it through the
//! scheduler for a few seconds, the way a real deployment would wire up
//! a loaded flow and call `start()`.

use oflux::config::RuntimeConfig;
use oflux::error::Result;
use oflux::flow::loader::{guard_ref, FlowBuilder};
use oflux::flow::{AccessMode, Case, Condition, NodeFlags, NodeResult};
use oflux::guard::{GuardKind, GuardTable};
use oflux::scheduler::Scheduler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let table = Arc::new(GuardTable::new());
    let flow = build_demo_flow(&table)?;
    let config = RuntimeConfig {
        initial_thread_pool_size: 4,
        ..RuntimeConfig::default()
    };

    let scheduler = Scheduler::new(config, flow, table);
    scheduler.start();

    println!();
    println!("╭─────────────────────────────────────────────────────────╮");
    println!("│  oflux demo flow is running                              │");
    println!("│  counter -> sink, guarded by one exclusive guard         │");
    println!("╰─────────────────────────────────────────────────────────╯");
    println!();

    std::thread::sleep(Duration::from_millis(500));

    scheduler.soft_kill();
    scheduler.join();

    tracing::info!("demo flow stopped");
    Ok(())
}

/// `counter` is a source: it self-loops forever, each time emitting the
/// next value of a shared counter protected by an exclusive guard, and
/// fans out to `sink`. `sink` just logs what it received.
fn build_demo_flow(table: &Arc<GuardTable>) -> Result<oflux::Flow> {
    let counter = Arc::new(AtomicU64::new(0));
    let mut builder = FlowBuilder::new();

    let counter_handler = {
        let counter = counter.clone();
        Arc::new(move |_input: &[u8]| {
            let value = counter.fetch_add(1, Ordering::Relaxed);
            NodeResult::ok(vec![value.to_le_bytes().to_vec()])
        })
    };
    let counter_node = builder.add_node(
        "counter",
        NodeFlags { is_source: true, ..Default::default() },
        counter_handler,
    )?;

    let sink_node = builder.add_node(
        "sink",
        NodeFlags::default(),
        Arc::new(|input: &[u8]| {
            let value = u64::from_le_bytes(input.try_into().unwrap_or_default());
            tracing::info!(value, "sink received value");
            NodeResult::ok(vec![])
        }),
    )?;

    let guard = guard_ref(table, "counter_guard", GuardKind::Exclusive, AccessMode::Exclusive);
    builder.set_guards(counter_node, vec![guard]);

    builder.set_cases(
        counter_node,
        vec![
            Case {
                target: counter_node,
                conditions: vec![Condition { argument_position: 0, negated: false, predicate: Arc::new(|_| true) }],
            },
            Case {
                target: sink_node,
                conditions: vec![Condition { argument_position: 0, negated: false, predicate: Arc::new(|_| true) }],
            },
        ],
    );

    builder.check_acyclic(table)?;
    Ok(builder.build())
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║  oflux -- dataflow runtime demo v{:<28}║", VERSION);
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}
