// Copyright (c) 2025 - Cowboy AI, Inc.
//! Dependency Graph
//!
//! A directed acyclic graph of provisioning steps. Each node is one step
//! on one entity (provision, accept, verify or teardown) pinned to the
//! account context it runs on; an edge `a → b` means "a must not start
//! before b reached a satisfying terminal status".
//!
//! # Ordering
//!
//! - [`DependencyGraph::topological_order`]: Kahn's algorithm, ties broken
//!   by node key so the order does not depend on declaration order
//! - [`DependencyGraph::teardown_order`]: the reverse of the above
//! - [`DependencyGraph::shortest_cycle`]: breadth-first search from every
//!   node, reporting the shortest cycle found

pub mod builder;
pub mod symbols;

pub use builder::{build_graph, KnownPeeringStates};
pub use symbols::SymbolTable;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use crate::domain::kind::{EntityKey, EntityKind};
use crate::state_machine::peering::PeeringState;

/// Index of a node inside one [`DependencyGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Which step a node performs on its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Create, update or confirm the entity
    Provision,
    /// Accept a peering connection on the accepter context
    Accept,
    /// Confirm an externally managed entity exists
    Verify,
    /// Remove the entity
    Teardown,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Provision => "provision",
            Step::Accept => "accept",
            Step::Verify => "verify",
            Step::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Identity of a node: (entity, step)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub entity: EntityKey,
    pub step: Step,
}

impl NodeKey {
    pub fn new(entity: EntityKey, step: Step) -> Self {
        Self { entity, step }
    }

    pub fn provision(entity: EntityKey) -> Self {
        Self::new(entity, Step::Provision)
    }

    pub fn teardown(entity: EntityKey) -> Self {
        Self::new(entity, Step::Teardown)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.step)
    }
}

/// Desired state of one entity as the adapter sees it
///
/// `attributes` hold the entity's own fields with references as logical
/// names; `references` map each reference field to the resolved key so the
/// scheduler can substitute remote ids at call time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub attributes: BTreeMap<String, Value>,
    pub references: BTreeMap<String, EntityKey>,
}

impl ResourceSpec {
    pub fn attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Record a resolved reference and its logical name as an attribute
    pub fn reference(mut self, field: &str, key: EntityKey) -> Self {
        self.attributes
            .insert(field.to_string(), Value::String(key.name.clone()));
        self.references.insert(field.to_string(), key);
        self
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Provisioned entities this spec points at
    pub fn dependencies(&self) -> BTreeSet<EntityKey> {
        self.references
            .values()
            .filter(|key| key.kind.is_provisioned())
            .cloned()
            .collect()
    }
}

/// One step on one entity, pinned to an account context
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: NodeId,
    pub key: NodeKey,
    /// Account context whose adapter executes this node
    pub context: String,
    pub spec: ResourceSpec,
}

impl GraphNode {
    pub fn kind(&self) -> EntityKind {
        self.key.entity.kind
    }
}

/// Structural errors found while building the graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate definition of {key}")]
    DuplicateSymbol { key: EntityKey },

    #[error("{from}: field {field} names '{name}', which is a {found}, expected a {expected}")]
    TypeMismatch {
        from: EntityKey,
        field: String,
        name: String,
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("{from}: field {field} names unknown {expected} '{name}'")]
    UnresolvedReference {
        from: EntityKey,
        field: String,
        name: String,
        expected: EntityKind,
    },

    #[error("dependency cycle: {}", render_cycle(.cycle))]
    CyclicDependency { cycle: Vec<NodeKey> },

    #[error(
        "{route} targets peering {peering} in state {}, routes require an active connection",
        .state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
    )]
    PrematureRoute {
        route: EntityKey,
        peering: String,
        state: Option<PeeringState>,
    },

    #[error("node {0} added twice")]
    DuplicateNode(NodeKey),
}

fn render_cycle(cycle: &[NodeKey]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(ToString::to_string).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

/// Adjacency-set DAG of provisioning steps
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    /// node → nodes it waits for
    dependencies: Vec<BTreeSet<NodeId>>,
    /// node → nodes waiting for it
    dependents: Vec<BTreeSet<NodeId>>,
    index: HashMap<NodeKey, NodeId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        key: NodeKey,
        context: impl Into<String>,
        spec: ResourceSpec,
    ) -> Result<NodeId, GraphError> {
        if self.index.contains_key(&key) {
            return Err(GraphError::DuplicateNode(key));
        }
        let id = NodeId(self.nodes.len());
        self.index.insert(key.clone(), id);
        self.nodes.push(GraphNode {
            id,
            key,
            context: context.into(),
            spec,
        });
        self.dependencies.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        Ok(id)
    }

    /// `dependent` must wait for `dependency`
    pub fn add_edge(&mut self, dependent: NodeId, dependency: NodeId) {
        self.dependencies[dependent.0].insert(dependency);
        self.dependents[dependency.0].insert(dependent);
    }

    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn dependencies(&self, id: NodeId) -> &BTreeSet<NodeId> {
        &self.dependencies[id.0]
    }

    pub fn dependents(&self, id: NodeId) -> &BTreeSet<NodeId> {
        &self.dependents[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dependencies first; ties broken by node key
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeMap<&NodeKey, NodeId> = self
            .nodes
            .iter()
            .filter(|node| remaining[node.id.0] == 0)
            .map(|node| (&node.key, node.id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, id)) = ready.pop_first() {
            order.push(id);
            for dependent in &self.dependents[id.0] {
                remaining[dependent.0] -= 1;
                if remaining[dependent.0] == 0 {
                    ready.insert(&self.nodes[dependent.0].key, *dependent);
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let cycle = self
            .shortest_cycle()
            .unwrap_or_default()
            .into_iter()
            .map(|id| self.nodes[id.0].key.clone())
            .collect();
        Err(GraphError::CyclicDependency { cycle })
    }

    /// Dependents first
    pub fn teardown_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Shortest cycle along dependency edges, if any
    ///
    /// Starts are tried in key order and only a strictly shorter cycle
    /// replaces the current best, so the result is deterministic.
    pub fn shortest_cycle(&self) -> Option<Vec<NodeId>> {
        let mut starts: Vec<&GraphNode> = self.nodes.iter().collect();
        starts.sort_by(|a, b| a.key.cmp(&b.key));

        let mut best: Option<Vec<NodeId>> = None;
        for start in starts {
            let bound = best.as_ref().map_or(usize::MAX, Vec::len);
            if let Some(cycle) = self.cycle_through(start.id, bound) {
                best = Some(cycle);
            }
        }
        best
    }

    /// Shortest cycle through `start` that is strictly shorter than `bound`
    fn cycle_through(&self, start: NodeId, bound: usize) -> Option<Vec<NodeId>> {
        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        let mut depth: HashMap<NodeId, usize> = HashMap::from([(start, 0)]);
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            let current_depth = depth[&current];
            if current_depth + 1 >= bound {
                return None;
            }
            for next in &self.dependencies[current.0] {
                if *next == start {
                    let mut path = vec![current];
                    let mut cursor = current;
                    while let Some(previous) = parent.get(&cursor) {
                        path.push(*previous);
                        cursor = *previous;
                    }
                    path.reverse();
                    return Some(path);
                }
                if !depth.contains_key(next) {
                    depth.insert(*next, current_depth + 1);
                    parent.insert(*next, current);
                    queue.push_back(*next);
                }
            }
        }
        None
    }

    /// Every node that directly or indirectly waits for `id`
    pub fn transitive_dependents(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = self.dependents[id.0].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents[next.0].iter().copied());
            }
        }
        seen
    }
}
