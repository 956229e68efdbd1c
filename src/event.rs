//! In-flight invocation of a flow node.
//!
//! An `Event` owns its input bytes, a slot for its output once the node
//! runs, an error code, and the [`crate::atomics_holder::AtomicsHolder`]
//! tracking how much of its guard set has been acquired so far. Events
//! form an acyclic, reference-counted predecessor chain: while an event
//! is alive it keeps its predecessor's output buffer (its own input)
//! allocated, and `release()` severs that link once the node has
//! consumed its input successfully.

use crate::atomics_holder::AtomicsHolder;
use crate::flow::NodeId;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique event identifier, assigned at construction. Used for
/// diagnostics (`log_snapshot`) and cycle-detection test harnesses, not
/// for equality of event identity (use `Arc::ptr_eq` for that).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

/// An in-flight invocation of a node.
///
/// `predecessor`, `output`, and `atomics` are behind `parking_lot::Mutex`
/// rather than plain fields because a parked event's state can be
/// mutated by whichever thread releases the guard it's waiting in, which
/// is never the thread that created the event.
pub struct Event {
    pub id: EventId,
    pub node: NodeId,
    predecessor: Mutex<Option<Arc<Event>>>,
    pub input: Vec<u8>,
    output: Mutex<Option<Vec<u8>>>,
    error_code: AtomicI32,
    pub atomics: Mutex<AtomicsHolder>,
    /// Guards against an event being parked in two guards' waiter chains
    /// at once, or resumed twice for the same parked wait -- a bug in the
    /// acquire-all-or-wait driver would otherwise silently double-execute
    /// a node.
    parked: AtomicBool,
}

impl Event {
    pub fn new(node: NodeId, input: Vec<u8>, predecessor: Option<Arc<Event>>, guard_count: usize) -> Arc<Self> {
        Arc::new(Self {
            id: EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)),
            node,
            predecessor: Mutex::new(predecessor),
            input,
            output: Mutex::new(None),
            error_code: AtomicI32::new(0),
            atomics: Mutex::new(AtomicsHolder::new(guard_count)),
            parked: AtomicBool::new(false),
        })
    }

    /// A freshly minted error event carries a private copy of the input
    /// bytes its originator received, since the originator may be
    /// released (and its input buffer dropped) before the error handler
    /// runs.
    pub fn new_error(node: NodeId, input: Vec<u8>, error_code: i32, guard_count: usize) -> Arc<Self> {
        let ev = Self::new(node, input, None, guard_count);
        ev.error_code.store(error_code, Ordering::Relaxed);
        ev
    }

    pub fn error_code(&self) -> i32 {
        self.error_code.load(Ordering::Relaxed)
    }

    pub fn set_error_code(&self, code: i32) {
        self.error_code.store(code, Ordering::Relaxed);
    }

    pub fn is_error(&self) -> bool {
        self.error_code() != 0
    }

    pub fn set_output(&self, output: Vec<u8>) {
        *self.output.lock() = Some(output);
    }

    pub fn output(&self) -> Option<Vec<u8>> {
        self.output.lock().clone()
    }

    /// Mark this event as parked inside a guard's waiter chain. Returns
    /// `false` if it was already parked, which indicates a driver bug
    /// (double-park) rather than a legitimate race.
    pub fn mark_parked(&self) -> bool {
        !self.parked.swap(true, Ordering::AcqRel)
    }

    /// Clear the parked flag when a guard releases this event back to a
    /// worker.
    pub fn clear_parked(&self) {
        self.parked.store(false, Ordering::Release);
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    /// Release the reference to this event's predecessor, severing the
    /// chain. Called once the node has successfully consumed its input.
    pub fn release(&self) {
        *self.predecessor.lock() = None;
    }

    pub fn predecessor(&self) -> Option<Arc<Event>> {
        self.predecessor.lock().clone()
    }
}

/// Type-erased payload a Pool guard hands back on acquisition, stashed
/// into the corresponding `HeldAtomic` entry rather than threaded through
/// a raw pointer the way the original's `slot` argument does.
pub type PoolResource = Box<dyn Any + Send + Sync>;

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("error_code", &self.error_code())
            .field("parked", &self.is_parked())
            .finish_non_exhaustive()
    }
}
