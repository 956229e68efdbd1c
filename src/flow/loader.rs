//! Flow construction.
//!
//! The real graph loader (XML deserializer, dynamic library loader) is
//! out of scope for this crate (spec §1 lists it as an external
//! collaborator). What lives here is the seam it plugs into --
//! [`FlowLoader`] -- and an in-memory [`FlowBuilder`] good enough to
//! construct flows for tests and the demo binary without a real loader.

use crate::error::{OfluxError, Result};
use crate::flow::{Case, Flow, GuardReference, Node, NodeFlags, NodeHandler, NodeId, NodeResult};
use crate::guard::{GuardId, GuardKind, GuardTable};
use std::collections::HashSet;
use std::sync::Arc;

/// Produces a materialized [`Flow`] from some external representation.
/// Implementations own the mapping from symbol names to function
/// pointers / trait objects; the core only ever sees the result.
pub trait FlowLoader {
    fn load(&self) -> Result<Flow>;
}

/// Builds a [`Flow`] in memory, assigning magic numbers to guard
/// references in the order guards are first referenced (a topological-of
/// -precedences order, per spec §6, in the absence of a real loader's
/// finer-grained analysis).
#[derive(Default)]
pub struct FlowBuilder {
    nodes: Vec<Node>,
    names: HashSet<String>,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning its [`NodeId`]. Guard references passed
    /// in must already carry a `magic_number` (assign globally via
    /// [`GuardTable::magic_number`] before calling this).
    pub fn add_node(&mut self, name: &str, flags: NodeFlags, handler: NodeHandler) -> Result<NodeId> {
        if !self.names.insert(name.to_string()) {
            return Err(OfluxError::DuplicateNode { name: name.to_string() });
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            flags,
            input_type: 0,
            output_type: 0,
            guards: Vec::new(),
            cases: Vec::new(),
            error_handler: None,
            handler,
        });
        Ok(id)
    }

    /// Convenience for tests and the demo binary: a node whose handler
    /// always succeeds with a single, unchanged copy of its input.
    pub fn add_echo_node(&mut self, name: &str, flags: NodeFlags) -> Result<NodeId> {
        self.add_node(name, flags, Arc::new(|input: &[u8]| NodeResult::ok(vec![input.to_vec()])))
    }

    pub fn set_guards(&mut self, node: NodeId, mut guards: Vec<GuardReference>) {
        guards.sort_by_key(|g| g.magic_number);
        self.nodes[node].guards = guards;
    }

    pub fn set_cases(&mut self, node: NodeId, cases: Vec<Case>) {
        self.nodes[node].cases = cases;
    }

    pub fn set_error_handler(&mut self, node: NodeId, handler: NodeId) {
        self.nodes[node].error_handler = Some(handler);
    }

    /// Detect a cycle in the guard-dependency graph implied by nodes that
    /// jointly reference overlapping guard sets out of magic-number
    /// order. A well-formed flow has none by construction (guards are
    /// globally ordered), so this is a defensive check for loader bugs.
    pub fn check_acyclic(&self, table: &GuardTable) -> Result<()> {
        for node in &self.nodes {
            let mut last = 0u64;
            for g in &node.guards {
                if g.magic_number < last {
                    let names: Vec<String> = node
                        .guards
                        .iter()
                        .filter_map(|r| table.name_of(r.guard_id))
                        .collect();
                    return Err(OfluxError::CyclicDependency(names));
                }
                last = g.magic_number;
            }
        }
        Ok(())
    }

    pub fn build(self) -> Flow {
        let initial_nodes = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.flags.is_initial)
            .map(|(i, _)| i)
            .collect();
        Flow { nodes: self.nodes, initial_nodes }
    }
}

/// Convenience for tests: register a guard with the table and wrap it in
/// a [`GuardReference`] at the guard's assigned magic number.
pub fn guard_ref(
    table: &GuardTable,
    name: &str,
    kind: GuardKind,
    mode: crate::flow::AccessMode,
) -> GuardReference {
    let guard_id: GuardId = table.get_or_create(name, kind);
    let magic_number = table.magic_number(guard_id);
    GuardReference { guard_id, mode, late: false, magic_number, late_resolver: None }
}
