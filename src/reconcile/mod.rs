// Copyright (c) 2025 - Cowboy AI, Inc.
//! Idempotency / Reconciliation Layer
//!
//! Compares each node's desired attributes with the persisted snapshot and
//! decides one operation per node. The result is an [`ExecutionPlan`]: the
//! dependency graph extended with teardown nodes, plus the operation for
//! every node.
//!
//! # Decisions
//!
//! | Snapshot vs. desired                          | Operation  |
//! |-----------------------------------------------|------------|
//! | no entry                                      | `Create`   |
//! | same attribute hash                           | `NoOp`     |
//! | mutable attributes differ, kind updatable     | `Update`   |
//! | immutable attribute differs, or not updatable | `Recreate` |
//! | a dependency is recreated                     | `Recreate` |
//! | recorded peering is rejected or deleted       | `Recreate` |
//! | entry no longer in the model                  | `Destroy`  |
//!
//! A recreate is split into a teardown node (destroy) and the provision
//! node (create), with the create waiting for the destroy. Teardown nodes
//! wait for the teardown (or rewrite) of every entity whose recorded
//! dependencies name them, so removal runs in reverse dependency order.

pub mod snapshot;
pub mod store;

pub use snapshot::{Snapshot, SnapshotEntry, SnapshotUpdate};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotError, SnapshotStore};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

use crate::domain::kind::{EntityKey, EntityKind};
use crate::graph::{DependencyGraph, GraphError, NodeId, NodeKey, ResourceSpec, Step};
use crate::state_machine::peering::PeeringState;

/// Operation class decided for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    NoOp,
    Create,
    Update,
    /// Create after the old object was destroyed by the paired teardown node
    Recreate,
    Destroy,
    /// Peering acceptance on the accepter context
    Accept,
    /// Existence check of externally managed material
    Verify,
}

impl Operation {
    /// Whether the operation changes remote state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Recreate | Operation::Destroy
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::NoOp => "no-op",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Recreate => "recreate",
            Operation::Destroy => "destroy",
            Operation::Accept => "accept",
            Operation::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Hashes of a desired spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// All attributes
    pub attribute_hash: String,
    /// Attributes that cannot change in place
    pub immutable_hash: String,
}

impl Fingerprint {
    pub fn of(kind: EntityKind, spec: &ResourceSpec) -> Self {
        let immutable = immutable_attributes(kind);
        let all: Map<String, Value> = spec
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let fixed: Map<String, Value> = spec
            .attributes
            .iter()
            .filter(|(k, _)| immutable.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            attribute_hash: hash_value(&Value::Object(all)),
            immutable_hash: hash_value(&Value::Object(fixed)),
        }
    }
}

fn hash_value(value: &Value) -> String {
    blake3::hash(value.to_string().as_bytes()).to_hex().to_string()
}

/// Attributes whose change forces destroy-then-create
pub fn immutable_attributes(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Segment => &["context", "cidr"],
        EntityKind::Subnet => &["segment", "cidr", "availability_zone"],
        EntityKind::RouteTable => &["segment"],
        EntityKind::RouteEntry => &["route_table", "destination"],
        EntityKind::RouteTableAssociation => &["route_table", "subnet"],
        EntityKind::InternetGateway => &["segment"],
        EntityKind::PeeringConnection => &["requester", "accepter"],
        EntityKind::SecurityRule => &["segment", "direction"],
        EntityKind::Instance => &["subnet", "key_pair"],
        EntityKind::DnsZone => &["context", "domain", "segment"],
        EntityKind::AccountContext | EntityKind::KeyPair => &[],
    }
}

/// Whether the provider can mutate this kind in place
pub fn supports_update(kind: EntityKind) -> bool {
    !matches!(
        kind,
        EntityKind::RouteTableAssociation | EntityKind::PeeringConnection
    )
}

/// Operation for one node, with the state it was decided from
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
    pub operation: Operation,
    pub reason: String,
    /// Desired hashes; `None` for teardown nodes
    pub fingerprint: Option<Fingerprint>,
    /// Snapshot entry at planning time
    pub previous: Option<SnapshotEntry>,
}

/// Graph plus one operation per node
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub graph: DependencyGraph,
    /// Indexed by `NodeId`
    pub operations: Vec<PlannedOperation>,
    /// Topological order of the extended graph
    pub order: Vec<NodeId>,
}

/// Operation counts of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub no_op: usize,
    pub create: usize,
    pub update: usize,
    pub recreate: usize,
    pub destroy: usize,
    pub accept: usize,
    pub verify: usize,
}

impl ExecutionPlan {
    pub fn operation(&self, id: NodeId) -> &PlannedOperation {
        &self.operations[id.0]
    }

    /// Nodes that will create, update, recreate or destroy
    pub fn count_mutations(&self) -> usize {
        self.operations
            .iter()
            .filter(|planned| planned.operation.is_mutation())
            .count()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for planned in &self.operations {
            let slot = match planned.operation {
                Operation::NoOp => &mut summary.no_op,
                Operation::Create => &mut summary.create,
                Operation::Update => &mut summary.update,
                Operation::Recreate => &mut summary.recreate,
                Operation::Destroy => &mut summary.destroy,
                Operation::Accept => &mut summary.accept,
                Operation::Verify => &mut summary.verify,
            };
            *slot += 1;
        }
        summary
    }

    /// Node performing `operation` on `entity`, if planned
    pub fn find(&self, entity: &EntityKey, step: Step) -> Option<NodeId> {
        self.graph.find(&NodeKey::new(entity.clone(), step))
    }
}

/// Decide an operation for every node and add teardown nodes
///
/// # Errors
/// `CyclicDependency` if the recorded dependencies of removed entities
/// contradict the desired graph.
pub fn reconcile(
    mut graph: DependencyGraph,
    snapshot: &Snapshot,
) -> Result<ExecutionPlan, GraphError> {
    let order = graph.topological_order()?;
    let mut operations: Vec<Option<PlannedOperation>> = vec![None; graph.len()];
    let mut replaced: BTreeSet<EntityKey> = BTreeSet::new();

    for &id in &order {
        let node = graph.node(id);
        let entity = &node.key.entity;
        let previous = snapshot.get(entity).cloned();

        let planned = match node.key.step {
            Step::Provision => {
                let fingerprint = Fingerprint::of(entity.kind, &node.spec);
                let (operation, reason) =
                    decide(entity.kind, &node.spec, &fingerprint, previous.as_ref(), &replaced);
                if operation == Operation::Recreate {
                    replaced.insert(entity.clone());
                }
                PlannedOperation {
                    operation,
                    reason,
                    fingerprint: Some(fingerprint),
                    previous,
                }
            }
            Step::Accept => {
                let active = previous
                    .as_ref()
                    .and_then(|entry| entry.peering_state)
                    == Some(PeeringState::Active);
                let (operation, reason) = if active && !replaced.contains(entity) {
                    (Operation::NoOp, "connection already active".to_string())
                } else {
                    (Operation::Accept, "acceptance required".to_string())
                };
                PlannedOperation {
                    operation,
                    reason,
                    fingerprint: None,
                    previous,
                }
            }
            Step::Verify => PlannedOperation {
                operation: Operation::Verify,
                reason: "existence check".to_string(),
                fingerprint: None,
                previous: None,
            },
            Step::Teardown => PlannedOperation {
                operation: Operation::Destroy,
                reason: "teardown".to_string(),
                fingerprint: None,
                previous,
            },
        };
        operations[id.0] = Some(planned);
    }

    // Teardown nodes: replaced entities, then entities that left the model
    let mut teardowns: Vec<(NodeId, EntityKey)> = Vec::new();
    for entity in &replaced {
        let Some(entry) = snapshot.get(entity) else {
            continue;
        };
        let teardown = graph.add_node(
            NodeKey::teardown(entity.clone()),
            entry.context.clone(),
            ResourceSpec::default(),
        )?;
        if let Some(provision) = graph.find(&NodeKey::provision(entity.clone())) {
            graph.add_edge(provision, teardown);
        }
        operations.push(Some(PlannedOperation {
            operation: Operation::Destroy,
            reason: "replaced by recreate".to_string(),
            fingerprint: None,
            previous: Some(entry.clone()),
        }));
        teardowns.push((teardown, entity.clone()));
    }

    for entry in snapshot.entries() {
        if graph.find(&NodeKey::provision(entry.key.clone())).is_some() {
            continue;
        }
        let teardown = graph.add_node(
            NodeKey::teardown(entry.key.clone()),
            entry.context.clone(),
            ResourceSpec::default(),
        )?;
        operations.push(Some(PlannedOperation {
            operation: Operation::Destroy,
            reason: "removed from model".to_string(),
            fingerprint: None,
            previous: Some(entry.clone()),
        }));
        teardowns.push((teardown, entry.key.clone()));
    }

    // Recorded dependencies, inverted
    for (teardown, entity) in &teardowns {
        for dependent in snapshot.dependents_of(entity) {
            let waits_for = graph
                .find(&NodeKey::teardown(dependent.key.clone()))
                .or_else(|| graph.find(&NodeKey::provision(dependent.key.clone())));
            if let Some(waits_for) = waits_for {
                graph.add_edge(*teardown, waits_for);
            }
        }
    }

    let operations: Vec<PlannedOperation> = operations.into_iter().flatten().collect();
    let order = graph.topological_order()?;

    let plan = ExecutionPlan {
        graph,
        operations,
        order,
    };
    let summary = plan.summary();
    info!(
        nodes = plan.graph.len(),
        create = summary.create,
        update = summary.update,
        recreate = summary.recreate,
        destroy = summary.destroy,
        no_op = summary.no_op,
        "Reconciliation plan ready"
    );
    Ok(plan)
}

fn decide(
    kind: EntityKind,
    spec: &ResourceSpec,
    fingerprint: &Fingerprint,
    previous: Option<&SnapshotEntry>,
    replaced: &BTreeSet<EntityKey>,
) -> (Operation, String) {
    let Some(previous) = previous else {
        return (Operation::Create, "not in snapshot".to_string());
    };

    if previous.immutable_hash != fingerprint.immutable_hash {
        return (Operation::Recreate, "immutable attribute changed".to_string());
    }

    if let Some(state) = previous.peering_state.filter(PeeringState::is_terminal) {
        return (Operation::Recreate, format!("connection is {state}"));
    }

    if let Some(dependency) = spec.dependencies().into_iter().find(|d| replaced.contains(d)) {
        debug!(%dependency, "Recreate cascades to dependent");
        return (Operation::Recreate, format!("dependency {dependency} is recreated"));
    }

    if previous.attribute_hash != fingerprint.attribute_hash {
        return if supports_update(kind) {
            (Operation::Update, "mutable attributes changed".to_string())
        } else {
            (Operation::Recreate, format!("{kind} cannot be updated in place"))
        };
    }

    (Operation::NoOp, "attributes unchanged".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RemoteId, RemoteStatus};
    use chrono::Utc;
    use serde_json::json;

    fn segment_spec(cidr: &str, tag: &str) -> ResourceSpec {
        ResourceSpec::default()
            .reference("context", EntityKey::new(EntityKind::AccountContext, "a"))
            .attribute("cidr", cidr)
            .attribute("tags", json!({ "env": tag }))
    }

    fn subnet_spec() -> ResourceSpec {
        ResourceSpec::default()
            .reference("segment", EntityKey::new(EntityKind::Segment, "vpc"))
            .attribute("cidr", "10.0.1.0/24")
            .attribute("availability_zone", "us-east-1a")
    }

    fn graph(segment: ResourceSpec) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let vpc = graph
            .add_node(
                NodeKey::provision(EntityKey::new(EntityKind::Segment, "vpc")),
                "a",
                segment,
            )
            .unwrap();
        let sub = graph
            .add_node(
                NodeKey::provision(EntityKey::new(EntityKind::Subnet, "sub")),
                "a",
                subnet_spec(),
            )
            .unwrap();
        graph.add_edge(sub, vpc);
        graph
    }

    fn entry(kind: EntityKind, name: &str, spec: &ResourceSpec) -> SnapshotEntry {
        let fingerprint = Fingerprint::of(kind, spec);
        SnapshotEntry {
            key: EntityKey::new(kind, name),
            context: "a".into(),
            remote_id: RemoteId::new(format!("id-{name}")),
            attribute_hash: fingerprint.attribute_hash,
            immutable_hash: fingerprint.immutable_hash,
            status: RemoteStatus::Available,
            peering_state: None,
            depends_on: spec.dependencies().into_iter().collect(),
            observed_at: Utc::now(),
        }
    }

    fn applied_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.insert(entry(EntityKind::Segment, "vpc", &segment_spec("10.0.0.0/16", "dev")));
        snapshot.insert(entry(EntityKind::Subnet, "sub", &subnet_spec()));
        snapshot
    }

    fn op(plan: &ExecutionPlan, kind: EntityKind, name: &str, step: Step) -> Operation {
        let id = plan.find(&EntityKey::new(kind, name), step).unwrap();
        plan.operation(id).operation
    }

    #[test]
    fn test_empty_snapshot_creates_everything() {
        let plan = reconcile(graph(segment_spec("10.0.0.0/16", "dev")), &Snapshot::default()).unwrap();
        assert_eq!(plan.summary().create, 2);
        assert_eq!(plan.count_mutations(), 2);
    }

    #[test]
    fn test_unchanged_model_is_all_no_op() {
        let plan = reconcile(graph(segment_spec("10.0.0.0/16", "dev")), &applied_snapshot()).unwrap();
        assert_eq!(plan.count_mutations(), 0);
        assert_eq!(plan.summary().no_op, 2);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let plan = reconcile(graph(segment_spec("10.0.0.0/16", "prod")), &applied_snapshot()).unwrap();
        assert_eq!(op(&plan, EntityKind::Segment, "vpc", Step::Provision), Operation::Update);
        assert_eq!(op(&plan, EntityKind::Subnet, "sub", Step::Provision), Operation::NoOp);
    }

    #[test]
    fn test_immutable_change_recreates_and_cascades() {
        let plan = reconcile(graph(segment_spec("10.2.0.0/16", "dev")), &applied_snapshot()).unwrap();

        assert_eq!(op(&plan, EntityKind::Segment, "vpc", Step::Provision), Operation::Recreate);
        assert_eq!(op(&plan, EntityKind::Subnet, "sub", Step::Provision), Operation::Recreate);
        assert_eq!(op(&plan, EntityKind::Segment, "vpc", Step::Teardown), Operation::Destroy);

        let pos = |kind, name, step| {
            let id = plan.find(&EntityKey::new(kind, name), step).unwrap();
            plan.order.iter().position(|n| *n == id).unwrap()
        };
        // Old subnet goes before old segment; new segment before new subnet
        assert!(pos(EntityKind::Subnet, "sub", Step::Teardown) < pos(EntityKind::Segment, "vpc", Step::Teardown));
        assert!(pos(EntityKind::Segment, "vpc", Step::Teardown) < pos(EntityKind::Segment, "vpc", Step::Provision));
        assert!(pos(EntityKind::Segment, "vpc", Step::Provision) < pos(EntityKind::Subnet, "sub", Step::Provision));
    }

    #[test]
    fn test_removed_entities_are_destroyed_dependents_first() {
        let mut snapshot = applied_snapshot();
        snapshot.insert(entry(
            EntityKind::InternetGateway,
            "igw",
            &ResourceSpec::default().reference("segment", EntityKey::new(EntityKind::Segment, "old")),
        ));
        snapshot.insert(entry(EntityKind::Segment, "old", &segment_spec("10.9.0.0/16", "dev")));

        let plan = reconcile(graph(segment_spec("10.0.0.0/16", "dev")), &snapshot).unwrap();
        assert_eq!(plan.summary().destroy, 2);

        let igw = plan
            .find(&EntityKey::new(EntityKind::InternetGateway, "igw"), Step::Teardown)
            .unwrap();
        let old = plan
            .find(&EntityKey::new(EntityKind::Segment, "old"), Step::Teardown)
            .unwrap();
        assert!(plan.graph.dependencies(old).contains(&igw));
    }

    #[test]
    fn test_association_change_is_recreate() {
        assert!(!supports_update(EntityKind::RouteTableAssociation));
        assert!(!supports_update(EntityKind::PeeringConnection));
        assert!(supports_update(EntityKind::RouteEntry));
    }
}
