// Copyright (c) 2025 - Cowboy AI, Inc.
//! Execution Scheduler
//!
//! Walks an [`ExecutionPlan`] and runs each node as soon as every node it
//! depends on finished successfully (Succeeded, or Skipped as a no-op).
//!
//! # Concurrency
//!
//! - One bounded pool (semaphore) per account context; nodes of different
//!   contexts without an edge between them run in parallel
//! - Writes to one route table (entries, associations) are serialized by a
//!   per-table mutex, held for a single write
//! - A failed node blocks all of its transitive dependents; independent
//!   subgraphs run to completion
//! - Cancellation skips nodes that have not started; in-flight nodes finish
//!
//! Remote ids of dependencies are read from the working snapshot when a
//! node is spawned and handed to the adapter as `{field}_id` attributes.

pub mod cancel;
pub mod retry;
pub mod worker;

pub use cancel::{CancellationHandle, CancellationToken};
pub use worker::{Completion, NodeError, NodeOutcome, NodeTask};

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterRegistry, Attributes};
use crate::config::ProvisionerConfig;
use crate::domain::kind::EntityKind;
use crate::graph::{GraphNode, NodeId};
use crate::reconcile::{ExecutionPlan, Snapshot};
use crate::report::{ApplyReport, NodeStatus, ReportEntry, SkipReason};
use crate::state_machine::node_lifecycle::{NodeEvent, NodePhase};
use crate::state_machine::StateMachine;

/// Report plus the snapshot after every update of the pass was applied
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub report: ApplyReport,
    pub snapshot: Snapshot,
}

/// Runs plans against the registered adapters
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: Arc<ProvisionerConfig>,
    adapters: AdapterRegistry,
}

impl Scheduler {
    /// A pool width of zero is raised to one
    pub fn new(mut config: ProvisionerConfig, adapters: AdapterRegistry) -> Self {
        config.workers_per_context = config.workers_per_context.max(1);
        Self {
            config: Arc::new(config),
            adapters,
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Execute `plan`, starting from `snapshot`
    #[instrument(name = "schedule", skip_all, fields(nodes = plan.graph.len()))]
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        snapshot: Snapshot,
        cancel: CancellationToken,
    ) -> ScheduleOutcome {
        let started_at = Utc::now();
        let mut run = Run::new(self, plan, snapshot, cancel);
        run.drive().await;

        let report = run.report(started_at);
        info!(
            summary = %report.summary,
            cancelled = report.cancelled,
            "Apply pass finished"
        );
        ScheduleOutcome {
            report,
            snapshot: run.snapshot,
        }
    }
}

enum TaskResult {
    /// Cancellation won the race for a worker
    Cancelled,
    Finished(NodeOutcome),
}

#[derive(Debug)]
struct NodeRecord {
    phase: NodePhase,
    status: Option<NodeStatus>,
    attempts: u32,
    error: Option<String>,
}

struct Run<'a> {
    scheduler: &'a Scheduler,
    plan: &'a ExecutionPlan,
    snapshot: Snapshot,
    cancel: CancellationToken,
    records: Vec<NodeRecord>,
    /// Unfinished dependencies per node
    waiting_on: Vec<usize>,
    pools: HashMap<String, Arc<Semaphore>>,
    table_locks: HashMap<String, Arc<Mutex<()>>>,
    tasks: JoinSet<(NodeId, TaskResult)>,
    task_nodes: HashMap<tokio::task::Id, NodeId>,
}

impl<'a> Run<'a> {
    fn new(
        scheduler: &'a Scheduler,
        plan: &'a ExecutionPlan,
        snapshot: Snapshot,
        cancel: CancellationToken,
    ) -> Self {
        let nodes = plan.graph.len();
        Self {
            scheduler,
            plan,
            snapshot,
            cancel,
            records: (0..nodes)
                .map(|_| NodeRecord {
                    phase: NodePhase::Pending,
                    status: None,
                    attempts: 0,
                    error: None,
                })
                .collect(),
            waiting_on: (0..nodes)
                .map(|index| plan.graph.dependencies(NodeId(index)).len())
                .collect(),
            pools: HashMap::new(),
            table_locks: HashMap::new(),
            tasks: JoinSet::new(),
            task_nodes: HashMap::new(),
        }
    }

    async fn drive(&mut self) {
        let plan = self.plan;
        for &id in &plan.order {
            if self.waiting_on[id.0] == 0 {
                self.launch(id);
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((id, result)) => self.complete(id, result),
                Err(error) => {
                    let Some(id) = self.task_nodes.get(&error.id()).copied() else {
                        warn!(%error, "Lost track of a failed worker");
                        continue;
                    };
                    let outcome = NodeOutcome {
                        result: Err(NodeError::Internal(format!("worker aborted: {error}"))),
                        attempts: 0,
                        updates: Vec::new(),
                    };
                    self.complete(id, TaskResult::Finished(outcome));
                }
            }
        }

        // Whatever never became ready was cut off by cancellation
        for index in 0..self.records.len() {
            if self.records[index].phase == NodePhase::Pending {
                self.settle(
                    NodeId(index),
                    NodeEvent::Cancel,
                    NodeStatus::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                );
            }
        }
    }

    fn pool(&mut self, context: &str) -> Arc<Semaphore> {
        let workers = self.scheduler.config.workers_per_context;
        Arc::clone(
            self.pools
                .entry(context.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(workers))),
        )
    }

    /// Route entries and associations share their table's lock
    fn table_lock(&mut self, node: &GraphNode) -> Option<Arc<Mutex<()>>> {
        if !matches!(
            node.kind(),
            EntityKind::RouteEntry | EntityKind::RouteTableAssociation
        ) {
            return None;
        }
        let table = node.spec.references.get("route_table")?;
        Some(Arc::clone(
            self.table_locks.entry(table.name.clone()).or_default(),
        ))
    }

    fn launch(&mut self, id: NodeId) {
        let plan = self.plan;
        let node = plan.graph.node(id);

        if self.cancel.is_cancelled() {
            self.settle(
                id,
                NodeEvent::Cancel,
                NodeStatus::Skipped {
                    reason: SkipReason::Cancelled,
                },
            );
            return;
        }

        let Some(adapter) = self.scheduler.adapters.get(&node.context) else {
            let error = NodeError::Internal(format!("no adapter for context {}", node.context));
            self.fail_unstarted(id, error);
            return;
        };
        let attributes = match resolve_attributes(node, &self.snapshot) {
            Ok(attributes) => attributes,
            Err(error) => {
                self.fail_unstarted(id, error);
                return;
            }
        };

        let planned = plan.operation(id);
        let task = NodeTask {
            key: node.key.clone(),
            context: node.context.clone(),
            operation: planned.operation,
            attributes,
            depends_on: node.spec.dependencies().into_iter().collect(),
            fingerprint: planned.fingerprint.clone(),
            entry: self.snapshot.get(&node.key.entity).cloned(),
            adapter,
            table_lock: self.table_lock(node),
            config: Arc::clone(&self.scheduler.config),
        };

        let pool = self.pool(&node.context);
        let mut cancel = self.cancel.clone();
        debug!(node = %node.key, context = %node.context, "Node ready");

        let handle = self.tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = pool.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                return (id, TaskResult::Cancelled);
            };
            if cancel.is_cancelled() {
                return (id, TaskResult::Cancelled);
            }
            (id, TaskResult::Finished(task.execute().await))
        });
        self.task_nodes.insert(handle.id(), id);
    }

    fn complete(&mut self, id: NodeId, result: TaskResult) {
        let outcome = match result {
            TaskResult::Cancelled => {
                self.settle(
                    id,
                    NodeEvent::Cancel,
                    NodeStatus::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                );
                return;
            }
            TaskResult::Finished(outcome) => outcome,
        };

        self.advance(id, NodeEvent::Start);
        for update in outcome.updates {
            self.snapshot.apply(update);
        }
        self.records[id.0].attempts = outcome.attempts;

        match outcome.result {
            Ok(Completion::Applied) => {
                self.settle(id, NodeEvent::Succeed, NodeStatus::Succeeded);
                self.release_dependents(id);
            }
            Ok(Completion::Unchanged) => {
                self.settle(
                    id,
                    NodeEvent::Skip,
                    NodeStatus::Skipped {
                        reason: SkipReason::NoOp,
                    },
                );
                self.release_dependents(id);
            }
            Err(error) => self.fail(id, error),
        }
    }

    fn advance(&mut self, id: NodeId, event: NodeEvent) {
        let record = &mut self.records[id.0];
        match record.phase.transition(&event) {
            Ok((next, ())) => record.phase = next,
            Err(error) => {
                warn!(node = %self.plan.graph.node(id).key, %error, "Ignored node event")
            }
        }
    }

    fn settle(&mut self, id: NodeId, event: NodeEvent, status: NodeStatus) {
        self.advance(id, event);
        self.records[id.0].status = Some(status);
    }

    fn fail_unstarted(&mut self, id: NodeId, error: NodeError) {
        self.advance(id, NodeEvent::Start);
        self.fail(id, error);
    }

    fn fail(&mut self, id: NodeId, error: NodeError) {
        let plan = self.plan;
        let failed = &plan.graph.node(id).key;
        warn!(node = %failed, %error, "Node failed, blocking dependents");

        self.records[id.0].error = Some(error.to_string());
        self.settle(
            id,
            NodeEvent::Fail,
            NodeStatus::Failed {
                reason: error.class().to_string(),
            },
        );

        for dependent in plan.graph.transitive_dependents(id) {
            if self.records[dependent.0].phase != NodePhase::Pending {
                continue;
            }
            self.records[dependent.0].error = Some(format!("dependency {failed} failed"));
            self.settle(
                dependent,
                NodeEvent::Block,
                NodeStatus::Blocked { by: failed.clone() },
            );
        }
    }

    fn release_dependents(&mut self, id: NodeId) {
        let plan = self.plan;
        for &dependent in plan.graph.dependents(id) {
            self.waiting_on[dependent.0] -= 1;
            if self.waiting_on[dependent.0] == 0
                && self.records[dependent.0].phase == NodePhase::Pending
            {
                self.launch(dependent);
            }
        }
    }

    fn report(&self, started_at: chrono::DateTime<Utc>) -> ApplyReport {
        let entries = self
            .plan
            .order
            .iter()
            .map(|&id| {
                let node = self.plan.graph.node(id);
                let record = &self.records[id.0];
                ReportEntry {
                    entity: node.key.entity.clone(),
                    step: node.key.step,
                    context: node.context.clone(),
                    operation: self.plan.operation(id).operation,
                    status: record.status.clone().unwrap_or(NodeStatus::Skipped {
                        reason: SkipReason::Cancelled,
                    }),
                    attempts: record.attempts,
                    error: record.error.clone(),
                }
            })
            .collect();
        ApplyReport::new(started_at, entries, self.cancel.is_cancelled())
    }
}

/// Desired attributes plus `{field}_id` for every provisioned reference
fn resolve_attributes(node: &GraphNode, snapshot: &Snapshot) -> Result<Attributes, NodeError> {
    let mut attributes = node.spec.attributes.clone();
    for (field, key) in &node.spec.references {
        if !key.kind.is_provisioned() {
            continue;
        }
        let entry = snapshot.get(key).ok_or_else(|| {
            NodeError::Internal(format!("{key} has no remote id for field {field}"))
        })?;
        attributes.insert(
            format!("{field}_id"),
            Value::String(entry.remote_id.as_str().to_string()),
        );
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CallKind, SimulatedCloud};
    use crate::config::{PollPolicy, RetryPolicy};
    use crate::domain::account::AccountContext;
    use crate::domain::kind::EntityKey;
    use crate::graph::{DependencyGraph, NodeKey, ResourceSpec};
    use crate::reconcile::reconcile;
    use std::time::Duration;

    fn config() -> ProvisionerConfig {
        ProvisionerConfig::default()
            .with_retry(RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2.0,
                jitter: false,
            })
            .with_poll(PollPolicy {
                initial_interval_ms: 1,
                max_interval_ms: 2,
            })
            .with_readiness_timeout(Duration::from_millis(200))
    }

    fn segment(graph: &mut DependencyGraph, name: &str) -> NodeId {
        graph
            .add_node(
                NodeKey::provision(EntityKey::new(EntityKind::Segment, name)),
                "a",
                ResourceSpec::default().attribute("cidr", "10.0.0.0/16"),
            )
            .unwrap()
    }

    fn subnet(graph: &mut DependencyGraph, name: &str, parent: &str, parent_id: NodeId) -> NodeId {
        let id = graph
            .add_node(
                NodeKey::provision(EntityKey::new(EntityKind::Subnet, name)),
                "a",
                ResourceSpec::default()
                    .reference("segment", EntityKey::new(EntityKind::Segment, parent)),
            )
            .unwrap();
        graph.add_edge(id, parent_id);
        id
    }

    #[tokio::test]
    async fn test_failure_blocks_only_dependents() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        cloud
            .fail_with_state("a", CallKind::Create, Some(EntityKind::Segment), "quota exceeded")
            .await;

        let mut graph = DependencyGraph::new();
        let broken = segment(&mut graph, "broken");
        subnet(&mut graph, "orphan", "broken", broken);
        graph
            .add_node(
                NodeKey::provision(EntityKey::new(EntityKind::InternetGateway, "standalone")),
                "a",
                ResourceSpec::default(),
            )
            .unwrap();
        let plan = reconcile(graph, &Snapshot::default()).unwrap();

        let scheduler = Scheduler::new(config(), cloud.registry([&a]));
        let outcome = scheduler
            .run(&plan, Snapshot::default(), CancellationToken::never())
            .await;
        let report = outcome.report;

        assert!(matches!(
            report.status_of(&EntityKey::new(EntityKind::Segment, "broken")),
            Some(NodeStatus::Failed { .. })
        ));
        assert!(matches!(
            report.status_of(&EntityKey::new(EntityKind::Subnet, "orphan")),
            Some(NodeStatus::Blocked { .. })
        ));
        assert_eq!(
            report.status_of(&EntityKey::new(EntityKind::InternetGateway, "standalone")),
            Some(&NodeStatus::Succeeded)
        );
        assert_eq!(outcome.snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_ids_are_substituted() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");

        let mut graph = DependencyGraph::new();
        let vpc = segment(&mut graph, "vpc");
        subnet(&mut graph, "sub", "vpc", vpc);
        let plan = reconcile(graph, &Snapshot::default()).unwrap();

        let outcome = Scheduler::new(config(), cloud.registry([&a]))
            .run(&plan, Snapshot::default(), CancellationToken::never())
            .await;
        assert!(outcome.report.is_success());

        let vpc_id = &outcome
            .snapshot
            .get(&EntityKey::new(EntityKind::Segment, "vpc"))
            .unwrap()
            .remote_id;
        let sub_id = &outcome
            .snapshot
            .get(&EntityKey::new(EntityKind::Subnet, "sub"))
            .unwrap()
            .remote_id;
        let sub = cloud.resource(sub_id).await.unwrap();
        assert_eq!(sub.attributes["segment_id"], Value::String(vpc_id.to_string()));
    }

    #[tokio::test]
    async fn test_zero_workers_still_makes_progress() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let mut graph = DependencyGraph::new();
        let vpc = segment(&mut graph, "vpc");
        subnet(&mut graph, "sub", "vpc", vpc);
        let plan = reconcile(graph, &Snapshot::default()).unwrap();

        let config = ProvisionerConfig {
            workers_per_context: 0,
            ..config()
        };
        let scheduler = Scheduler::new(config, cloud.registry([&a]));
        assert_eq!(scheduler.config().workers_per_context, 1);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run(&plan, Snapshot::default(), CancellationToken::never()),
        )
        .await
        .expect("scheduler stalled");
        assert!(outcome.report.is_success());
        assert_eq!(outcome.snapshot.len(), 2);
    }

    #[test]
    fn test_table_lock_follows_the_route_table_reference() {
        let table = EntityKey::new(EntityKind::RouteTable, "edge:blue");
        let mut graph = DependencyGraph::new();
        let route = graph
            .add_node(
                NodeKey::provision(EntityKey::route_entry("edge:blue", "0.0.0.0/0")),
                "a",
                ResourceSpec::default().reference("route_table", table.clone()),
            )
            .unwrap();
        let association = graph
            .add_node(
                NodeKey::provision(EntityKey::association("edge:blue", "app")),
                "a",
                ResourceSpec::default().reference("route_table", table),
            )
            .unwrap();
        let other = graph
            .add_node(
                NodeKey::provision(EntityKey::route_entry("edge", "10.9.0.0/16")),
                "a",
                ResourceSpec::default()
                    .reference("route_table", EntityKey::new(EntityKind::RouteTable, "edge")),
            )
            .unwrap();
        let plan = reconcile(graph, &Snapshot::default()).unwrap();
        let scheduler = Scheduler::new(config(), AdapterRegistry::new());
        let mut run = Run::new(&scheduler, &plan, Snapshot::default(), CancellationToken::never());

        let route_lock = run.table_lock(plan.graph.node(route)).unwrap();
        let association_lock = run.table_lock(plan.graph.node(association)).unwrap();
        let other_lock = run.table_lock(plan.graph.node(other)).unwrap();
        assert!(Arc::ptr_eq(&route_lock, &association_lock));
        assert!(!Arc::ptr_eq(&route_lock, &other_lock));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let mut graph = DependencyGraph::new();
        let vpc = segment(&mut graph, "vpc");
        subnet(&mut graph, "sub", "vpc", vpc);
        let plan = reconcile(graph, &Snapshot::default()).unwrap();

        let (handle, token) = CancellationHandle::new();
        handle.cancel();
        let outcome = Scheduler::new(config(), cloud.registry([&a]))
            .run(&plan, Snapshot::default(), token)
            .await;

        assert!(outcome.report.cancelled);
        assert_eq!(outcome.report.summary.skipped, 2);
        assert_eq!(cloud.call_count().await, 0);
    }
}
