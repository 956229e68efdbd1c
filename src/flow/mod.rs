//! The loaded, immutable flow graph: nodes, guard references, and cases.
//!
//! A `Flow` is produced by an external loader (XML deserializer, dynamic
//! library loader -- out of scope here, see spec §1) and handed to the
//! scheduler as a read-only graph. Everything in this module is data: no
//! guard acquisition or dispatch logic lives here, only the shapes that
//! [`crate::guard`] and [`crate::scheduler::dispatch`] walk.

pub mod loader;

use std::sync::Arc;

/// Opaque fingerprint of a node's input or output type, assigned by the
/// loader. The core never inspects these beyond equality -- type safety
/// that templates would give the original is pushed here instead.
pub type TypeHash = u64;

/// Per-node concurrency and scheduling flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// Re-emitted after each execution to sustain an input stream.
    pub is_source: bool,
    /// Emitted once at startup.
    pub is_initial: bool,
    /// Permitted to issue blocking syscalls; its worker steps out of the
    /// runnable pool while executing it.
    pub is_detached: bool,
    /// Receives routed errors instead of normal successor dispatch.
    pub is_error_handler: bool,
    /// Source-like node invoked by an external IPC door call.
    pub is_door: bool,
}

/// The mode under which a node asks to acquire a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    Exclusive,
    /// Resolved at acquire time to `Read` or `Write` -- see
    /// [`crate::guard::rwlock`] for the resolution rule.
    Upgradeable,
}

/// A reference from a node to one of the guards it must hold while
/// executing, pre-sorted (by the loader) into ascending magic-number
/// order so acquisition is monotonic.
#[derive(Clone)]
pub struct GuardReference {
    pub guard_id: crate::guard::GuardId,
    pub mode: AccessMode,
    /// Resolved at fire time against the executing node's output rather
    /// than its input; participates in sorted acquisition the same way,
    /// but its key is computed later.
    pub late: bool,
    pub magic_number: u64,
    /// When `late` is set, resolves the guard to acquire from the
    /// successor event's input (the producing node's output) instead of
    /// the statically assigned `guard_id`. `None` means `late` carries no
    /// resolver and the static `guard_id` is used as-is -- the common
    /// case for every guard reference built by [`loader::FlowBuilder`].
    pub late_resolver: Option<Arc<dyn Fn(&[u8]) -> crate::guard::GuardId + Send + Sync>>,
}

impl std::fmt::Debug for GuardReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardReference")
            .field("guard_id", &self.guard_id)
            .field("mode", &self.mode)
            .field("late", &self.late)
            .field("magic_number", &self.magic_number)
            .finish_non_exhaustive()
    }
}

impl GuardReference {
    /// Resolve the guard id to actually acquire against, given the event
    /// that will hold it. Non-late references (the overwhelming common
    /// case) just return their static id.
    pub fn resolve(&self, input: &[u8]) -> crate::guard::GuardId {
        if self.late {
            if let Some(resolver) = &self.late_resolver {
                return resolver(input);
            }
        }
        self.guard_id
    }
}

/// A condition evaluated against a node's output at the declared argument
/// position; may be negated. The function pointer is supplied by the
/// loader and is opaque to the core.
#[derive(Clone)]
pub struct Condition {
    pub argument_position: usize,
    pub negated: bool,
    pub predicate: Arc<dyn Fn(&[u8]) -> bool + Send + Sync>,
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("argument_position", &self.argument_position)
            .field("negated", &self.negated)
            .finish_non_exhaustive()
    }
}

impl Condition {
    /// Evaluate the condition against a node's output, honoring negation.
    pub fn evaluate(&self, output: &[u8]) -> bool {
        let result = (self.predicate)(output);
        result != self.negated
    }
}

/// A conditional successor edge. Fires when every condition evaluates
/// true against the completed node's output.
#[derive(Debug, Clone)]
pub struct Case {
    pub target: NodeId,
    pub conditions: Vec<Condition>,
}

impl Case {
    pub fn fires(&self, output: &[u8]) -> bool {
        self.conditions.iter().all(|c| c.evaluate(output))
    }
}

/// Index of a node within a [`Flow`]'s node table.
pub type NodeId = usize;

/// What running a node produced: zero or more output values (more than
/// one iff the node splayed its output) and a return code. Non-zero
/// routes to the node's error handler instead of its cases.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub outputs: Vec<Vec<u8>>,
    pub error_code: i32,
}

impl NodeResult {
    pub fn ok(outputs: Vec<Vec<u8>>) -> Self {
        Self { outputs, error_code: 0 }
    }

    pub fn err(error_code: i32) -> Self {
        Self { outputs: Vec::new(), error_code }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

/// The unit of work a node runs against its input. The original's
/// per-node generated stub (marshaling typed arguments) is out of scope
/// here (spec §1); this is the seam it would plug into.
pub type NodeHandler = Arc<dyn Fn(&[u8]) -> NodeResult + Send + Sync>;

/// A vertex in the flow: a unit of work with typed input/output, a
/// pre-sorted guard list, and successor routing.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub flags: NodeFlags,
    pub input_type: TypeHash,
    pub output_type: TypeHash,
    pub guards: Vec<GuardReference>,
    pub cases: Vec<Case>,
    /// Edge taken instead of `cases` when the node returns non-zero.
    pub error_handler: Option<NodeId>,
    pub handler: NodeHandler,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("guards", &self.guards)
            .field("cases", &self.cases)
            .field("error_handler", &self.error_handler)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Self-edge a source re-emits after every execution (and, per the
    /// spec's preserved open question, on error as well for non-initial
    /// sources).
    pub fn source_self_edge(&self, self_id: NodeId) -> Option<NodeId> {
        self.flags.is_source.then_some(self_id)
    }
}

/// An init-callback bundle supplied by a dynamically loaded library.
/// Opaque to the core beyond its name and init/fini hooks.
pub struct Library {
    pub name: String,
    pub init: Option<Arc<dyn Fn() -> Result<(), String> + Send + Sync>>,
    pub fini: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("name", &self.name).finish_non_exhaustive()
    }
}

/// The complete, immutable graph the scheduler executes. Read-only after
/// load; a reload swaps in a new `Flow` atomically behind the manager
/// lock (see [`crate::scheduler::Scheduler::reload`]).
#[derive(Debug, Clone, Default)]
pub struct Flow {
    pub nodes: Vec<Node>,
    pub initial_nodes: Vec<NodeId>,
}

impl Flow {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// All nodes flagged `is_source`, for seeding the scheduler at startup.
    pub fn source_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.flags.is_source)
            .map(|(i, _)| i)
    }
}
