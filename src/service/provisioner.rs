// Copyright (c) 2025 - Cowboy AI, Inc.
//! Provisioning Service
//!
//! One apply pass is a transaction over the snapshot:
//! 1. Load the snapshot
//! 2. Build the dependency graph (references, cycles, premature routes)
//! 3. Validate routing and CIDR invariants
//! 4. Reconcile desired state against the snapshot
//! 5. Check every context in the plan has an adapter
//! 6. Schedule the plan
//! 7. Write the snapshot back atomically
//!
//! Steps 2 to 5 are structural: any failure aborts the pass before the
//! first remote call. Node failures during step 6 only show in the report.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};

use crate::adapter::AdapterRegistry;
use crate::config::ProvisionerConfig;
use crate::domain::invariants::validate_topology;
use crate::domain::topology::Topology;
use crate::errors::{ProvisioningError, ProvisioningResult};
use crate::graph::build_graph;
use crate::reconcile::{reconcile, ExecutionPlan, FileSnapshotStore, Snapshot, SnapshotStore};
use crate::report::ApplyReport;
use crate::scheduler::{CancellationToken, Scheduler};

/// Application service interface for realizing a topology
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Plan against the stored snapshot without any remote call
    async fn plan(&self, topology: &Topology) -> ProvisioningResult<ExecutionPlan>;

    /// Plan, execute and persist
    async fn apply(&self, topology: &Topology) -> ProvisioningResult<ApplyReport> {
        self.apply_with_cancellation(topology, CancellationToken::never())
            .await
    }

    /// As [`apply`](Self::apply), stopping early once `cancel` fires
    async fn apply_with_cancellation(
        &self,
        topology: &Topology,
        cancel: CancellationToken,
    ) -> ProvisioningResult<ApplyReport>;
}

/// Snapshot-backed provisioner
pub struct Provisioner<S: SnapshotStore> {
    scheduler: Scheduler,
    store: S,
}

impl Provisioner<FileSnapshotStore> {
    /// Snapshot kept at `config.snapshot_path`
    pub fn with_file_store(config: ProvisionerConfig, adapters: AdapterRegistry) -> Self {
        let store = FileSnapshotStore::new(config.snapshot_path.clone());
        Self::new(config, adapters, store)
    }
}

impl<S: SnapshotStore> Provisioner<S> {
    pub fn new(config: ProvisionerConfig, adapters: AdapterRegistry, store: S) -> Self {
        Self {
            scheduler: Scheduler::new(config, adapters),
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn plan_against(&self, topology: &Topology, snapshot: &Snapshot) -> ProvisioningResult<ExecutionPlan> {
        let graph = build_graph(topology, &snapshot.peering_states())?;
        validate_topology(topology)?;
        let plan = reconcile(graph, snapshot)?;

        for node in plan.graph.nodes() {
            if self.scheduler.adapters().get(&node.context).is_none() {
                return Err(ProvisioningError::MissingAdapter(node.context.clone()));
            }
        }
        Ok(plan)
    }
}

#[async_trait]
impl<S: SnapshotStore> ProvisioningService for Provisioner<S> {
    #[instrument(skip_all)]
    async fn plan(&self, topology: &Topology) -> ProvisioningResult<ExecutionPlan> {
        let snapshot = self.store.load().await?;
        self.plan_against(topology, &snapshot)
    }

    #[instrument(skip_all)]
    async fn apply_with_cancellation(
        &self,
        topology: &Topology,
        cancel: CancellationToken,
    ) -> ProvisioningResult<ApplyReport> {
        let snapshot = self.store.load().await?;
        let plan = self.plan_against(topology, &snapshot)?;
        let summary = plan.summary();
        info!(
            nodes = plan.graph.len(),
            mutations = plan.count_mutations(),
            create = summary.create,
            destroy = summary.destroy,
            "Applying plan"
        );

        let outcome = self.scheduler.run(&plan, snapshot, cancel).await;

        let mut snapshot = outcome.snapshot;
        snapshot.updated_at = Some(Utc::now());
        self.store.save(&snapshot).await?;
        info!(entries = snapshot.len(), "Snapshot saved");

        Ok(outcome.report)
    }
}
