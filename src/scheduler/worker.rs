// Copyright (c) 2025 - Cowboy AI, Inc.
//! Node Execution
//!
//! Runs one planned node against its context's adapter and reports the
//! snapshot changes it caused. Workers never touch the snapshot directly;
//! the scheduler applies the returned updates in completion order.

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use super::retry::{poll_until, with_retry, PollError, Probe, RetryError};
use crate::adapter::{
    AdapterError, Attributes, CloudProviderAdapter, RemoteId, RemoteState, RemoteStatus,
};
use crate::config::{ProvisionerConfig, RetryPolicy};
use crate::domain::kind::{EntityKey, EntityKind};
use crate::domain::topology::ZoneRecord;
use crate::graph::{NodeKey, Step};
use crate::reconcile::{Fingerprint, Operation, SnapshotEntry, SnapshotUpdate};
use crate::state_machine::peering::{PeeringInput, PeeringState};
use crate::state_machine::StateMachineWithHistory;

/// Node-scoped failure; recorded in the report, never aborts the apply
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("transient provider error persisted after {attempts} attempts: {message}")]
    RemoteTransient { attempts: u32, message: String },

    #[error("provider rejected the request: {0}")]
    RemoteState(String),

    /// A guarded delete found the resource not empty; nothing was changed
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("peering connection {peering} was not accepted within {waited_ms}ms")]
    AcceptanceTimeout { peering: String, waited_ms: u64 },

    #[error("{entity} did not become ready within {waited_ms}ms")]
    NotReady { entity: String, waited_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Short class name used as the report's failure reason
    pub fn class(&self) -> &'static str {
        match self {
            NodeError::RemoteTransient { .. } => "remote-transient",
            NodeError::RemoteState(_) => "remote-state",
            NodeError::Precondition(_) => "precondition",
            NodeError::AcceptanceTimeout { .. } => "acceptance-timeout",
            NodeError::NotReady { .. } => "not-ready",
            NodeError::Internal(_) => "internal",
        }
    }
}

impl From<AdapterError> for NodeError {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Transient(message) => NodeError::RemoteTransient {
                attempts: 1,
                message,
            },
            AdapterError::State(message) => NodeError::RemoteState(message),
        }
    }
}

impl From<RetryError> for NodeError {
    fn from(error: RetryError) -> Self {
        match error.error {
            AdapterError::Transient(message) => NodeError::RemoteTransient {
                attempts: error.attempts,
                message,
            },
            AdapterError::State(message) => NodeError::RemoteState(message),
        }
    }
}

/// How a node that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Remote state was changed or confirmed by an explicit step
    Applied,
    /// Nothing needed doing
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub result: Result<Completion, NodeError>,
    /// Adapter call attempts, retries included
    pub attempts: u32,
    pub updates: Vec<SnapshotUpdate>,
}

/// Everything one node needs, resolved by the scheduler at spawn time
pub struct NodeTask {
    pub key: NodeKey,
    pub context: String,
    pub operation: Operation,
    /// Desired attributes with `{field}_id` remote ids filled in
    pub attributes: Attributes,
    pub depends_on: Vec<EntityKey>,
    pub fingerprint: Option<Fingerprint>,
    /// Current snapshot entry of the node's entity
    pub entry: Option<SnapshotEntry>,
    pub adapter: Arc<dyn CloudProviderAdapter>,
    /// Held around writes to a shared route table
    pub table_lock: Option<Arc<Mutex<()>>>,
    pub config: Arc<ProvisionerConfig>,
}

impl NodeTask {
    #[instrument(
        name = "node",
        skip(self),
        fields(node = %self.key, context = %self.context, operation = %self.operation)
    )]
    pub async fn execute(self) -> NodeOutcome {
        let mut run = Execution {
            task: self,
            attempts: 0,
            updates: Vec::new(),
        };
        let result = run.dispatch().await;
        match &result {
            Ok(completion) => debug!(?completion, attempts = run.attempts, "Node finished"),
            Err(error) => warn!(%error, attempts = run.attempts, "Node failed"),
        }
        NodeOutcome {
            result,
            attempts: run.attempts,
            updates: run.updates,
        }
    }
}

struct Execution {
    task: NodeTask,
    attempts: u32,
    updates: Vec<SnapshotUpdate>,
}

/// One adapter call under the retry policy, counting attempts
async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    attempts: &mut u32,
    label: &str,
    operation: F,
) -> Result<T, NodeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    match with_retry(policy, label, operation).await {
        Ok((value, used)) => {
            *attempts += used;
            Ok(value)
        }
        Err(error) => {
            *attempts += error.attempts;
            Err(error.into())
        }
    }
}

impl Execution {
    fn entity(&self) -> &EntityKey {
        &self.task.key.entity
    }

    fn kind(&self) -> EntityKind {
        self.task.key.entity.kind
    }

    async fn dispatch(&mut self) -> Result<Completion, NodeError> {
        match (self.task.key.step, self.task.operation) {
            (Step::Verify, _) => self.verify().await,
            (Step::Accept, _) => self.accept().await,
            (_, Operation::Destroy) => self.destroy().await,
            (Step::Provision, Operation::NoOp) => self.confirm().await,
            (Step::Provision, Operation::Create | Operation::Recreate) => self.create().await,
            (Step::Provision, Operation::Update) => self.update().await,
            (step, operation) => Err(NodeError::Internal(format!(
                "{operation} is not valid for a {step} node"
            ))),
        }
    }

    async fn lock_table(&self) -> Option<OwnedMutexGuard<()>> {
        match &self.task.table_lock {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        }
    }

    fn recorded_entry(&self) -> Result<SnapshotEntry, NodeError> {
        self.task
            .entry
            .clone()
            .ok_or_else(|| NodeError::Internal(format!("{} has no snapshot entry", self.entity())))
    }

    fn fingerprint(&self) -> Result<Fingerprint, NodeError> {
        self.task
            .fingerprint
            .clone()
            .ok_or_else(|| NodeError::Internal(format!("{} has no desired fingerprint", self.entity())))
    }

    async fn describe(&mut self, remote_id: &RemoteId) -> Result<RemoteState, NodeError> {
        let adapter = Arc::clone(&self.task.adapter);
        retry(&self.task.config.retry, &mut self.attempts, "describe", || {
            adapter.describe(remote_id)
        })
        .await
    }

    /// Replay an observed handshake state onto the recorded one
    fn advance_peering(&self, from: PeeringState, observed: Option<PeeringState>) -> PeeringState {
        let Some(target) = observed else {
            return from;
        };
        let mut fsm = StateMachineWithHistory::new(from);
        for input in from.inputs_toward(target) {
            if let Err(error) = fsm.transition_with_history(input, Utc::now()) {
                warn!(peering = %self.entity(), %error, "Observed handshake state not reachable");
                break;
            }
        }
        for step in fsm.get_history() {
            debug!(
                peering = %self.entity(),
                from = %step.from,
                to = %step.to,
                input = ?step.input,
                "Peering transition"
            );
        }
        *fsm.current_state()
    }

    fn snapshot_entry(
        &self,
        remote_id: RemoteId,
        fingerprint: &Fingerprint,
        observed: &RemoteState,
        peering_state: Option<PeeringState>,
    ) -> SnapshotEntry {
        SnapshotEntry {
            key: self.entity().clone(),
            context: self.task.context.clone(),
            remote_id,
            attribute_hash: fingerprint.attribute_hash.clone(),
            immutable_hash: fingerprint.immutable_hash.clone(),
            status: observed.status,
            peering_state,
            depends_on: self.task.depends_on.clone(),
            observed_at: Utc::now(),
        }
    }

    /// Poll until the new resource is usable
    ///
    /// Peering connections are usable once acknowledged; instances once
    /// available.
    async fn await_ready(&mut self, remote_id: &RemoteId) -> Result<RemoteState, NodeError> {
        let adapter = Arc::clone(&self.task.adapter);
        let is_peering = self.kind() == EntityKind::PeeringConnection;
        let config = Arc::clone(&self.task.config);

        poll_until(&config.poll, config.readiness_timeout(), || {
            let adapter = Arc::clone(&adapter);
            let remote_id = remote_id.clone();
            async move {
                let state = adapter.describe(&remote_id).await?;
                let ready = if is_peering {
                    match state.peering {
                        Some(terminal) if terminal.is_terminal() => {
                            return Err(AdapterError::State(format!(
                                "peering connection {remote_id} is {terminal}"
                            )))
                        }
                        Some(PeeringState::PendingAcceptance | PeeringState::Active) => true,
                        _ => false,
                    }
                } else {
                    state.status == RemoteStatus::Available
                };
                Ok(if ready { Probe::Ready(state) } else { Probe::Pending })
            }
        })
        .await
        .map_err(|error| match error {
            PollError::TimedOut { waited } => NodeError::NotReady {
                entity: self.entity().to_string(),
                waited_ms: waited.as_millis() as u64,
            },
            PollError::Adapter(error) => error.into(),
        })
    }

    async fn create(&mut self) -> Result<Completion, NodeError> {
        let kind = self.kind();
        let fingerprint = self.fingerprint()?;
        let adapter = Arc::clone(&self.task.adapter);
        let attributes = self.task.attributes.clone();

        let remote_id = {
            let _table = self.lock_table().await;
            retry(&self.task.config.retry, &mut self.attempts, "create", || {
                adapter.create(kind, &attributes)
            })
            .await?
        };
        debug!(%remote_id, "Created");

        let observed = self.await_ready(&remote_id).await?;
        let peering_state = (kind == EntityKind::PeeringConnection)
            .then(|| self.advance_peering(PeeringState::Requested, observed.peering));

        let entry = self.snapshot_entry(remote_id, &fingerprint, &observed, peering_state);
        self.updates.push(SnapshotUpdate::Upsert(entry));
        Ok(Completion::Applied)
    }

    /// Confirm a no-op node still exists; re-create it if it vanished
    async fn confirm(&mut self) -> Result<Completion, NodeError> {
        let entry = self.recorded_entry()?;
        let observed = self.describe(&entry.remote_id).await?;

        if !observed.exists() {
            warn!(remote_id = %entry.remote_id, "Resource vanished remotely, re-creating");
            let key = self.entity().clone();
            self.updates.push(SnapshotUpdate::Remove(key));
            return self.create().await;
        }

        let peering_state = match entry.peering_state {
            Some(recorded) => Some(self.advance_peering(recorded, observed.peering)),
            None => observed.peering,
        };
        let refreshed = SnapshotEntry {
            status: observed.status,
            peering_state,
            observed_at: Utc::now(),
            ..entry
        };
        self.updates.push(SnapshotUpdate::Upsert(refreshed));
        Ok(Completion::Unchanged)
    }

    async fn update(&mut self) -> Result<Completion, NodeError> {
        let entry = self.recorded_entry()?;
        let fingerprint = self.fingerprint()?;
        let adapter = Arc::clone(&self.task.adapter);
        let attributes = self.task.attributes.clone();

        {
            let _table = self.lock_table().await;
            retry(&self.task.config.retry, &mut self.attempts, "update", || {
                adapter.update(&entry.remote_id, &attributes)
            })
            .await?;
        }

        let updated = SnapshotEntry {
            attribute_hash: fingerprint.attribute_hash,
            immutable_hash: fingerprint.immutable_hash,
            depends_on: self.task.depends_on.clone(),
            observed_at: Utc::now(),
            ..entry
        };
        self.updates.push(SnapshotUpdate::Upsert(updated));
        Ok(Completion::Applied)
    }

    async fn destroy(&mut self) -> Result<Completion, NodeError> {
        let Some(entry) = self.task.entry.clone() else {
            return Ok(Completion::Unchanged);
        };
        let observed = self.describe(&entry.remote_id).await?;
        if !observed.exists() {
            debug!(remote_id = %entry.remote_id, "Already gone");
            let key = self.entity().clone();
            self.updates.push(SnapshotUpdate::Remove(key));
            return Ok(Completion::Applied);
        }

        let adapter = Arc::clone(&self.task.adapter);
        if self.kind() == EntityKind::DnsZone {
            self.empty_zone(&entry.remote_id, &observed).await?;
        }

        {
            let _table = self.lock_table().await;
            retry(&self.task.config.retry, &mut self.attempts, "delete", || {
                adapter.delete(&entry.remote_id)
            })
            .await?;
        }

        if self.kind() == EntityKind::PeeringConnection {
            let from = entry.peering_state.unwrap_or(PeeringState::Requested);
            self.advance_peering(from, Some(PeeringState::Deleted));
        }
        let key = self.entity().clone();
        self.updates.push(SnapshotUpdate::Remove(key));
        Ok(Completion::Applied)
    }

    /// Zone deletion guard
    ///
    /// A zone is deleted only once it holds nothing but system records.
    /// With `purge_zone_records` set, the records the zone was declared
    /// with are cleared first; any other record always fails the node
    /// before a destructive call is made.
    async fn empty_zone(&mut self, remote_id: &RemoteId, observed: &RemoteState) -> Result<(), NodeError> {
        let domain = observed
            .attributes
            .get("domain")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let managed: Vec<ZoneRecord> = observed
            .attributes
            .get("records")
            .cloned()
            .and_then(|records| serde_json::from_value(records).ok())
            .unwrap_or_default();

        let foreign: Vec<String> = observed
            .records
            .iter()
            .filter(|record| !record.is_system_managed(domain) && !managed.contains(record))
            .map(|record| format!("{} {}", record.name, record.record_type))
            .collect();
        if !foreign.is_empty() {
            return Err(NodeError::Precondition(format!(
                "zone {domain} holds records it was not created with: {}",
                foreign.join(", ")
            )));
        }

        let declared: Vec<String> = observed
            .records
            .iter()
            .filter(|record| !record.is_system_managed(domain))
            .map(|record| format!("{} {}", record.name, record.record_type))
            .collect();
        if declared.is_empty() {
            return Ok(());
        }
        if !self.task.config.purge_zone_records {
            return Err(NodeError::Precondition(format!(
                "zone {domain} still holds records: {}",
                declared.join(", ")
            )));
        }
        let adapter = Arc::clone(&self.task.adapter);
        let cleared = Attributes::from([("records".to_string(), Value::Array(Vec::new()))]);
        retry(&self.task.config.retry, &mut self.attempts, "update", || {
            adapter.update(remote_id, &cleared)
        })
        .await?;
        Ok(())
    }

    async fn verify(&mut self) -> Result<Completion, NodeError> {
        let key_name = self
            .task
            .attributes
            .get("key_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NodeError::Internal(format!("{} has no key name", self.entity())))?;
        let region = self
            .task
            .attributes
            .get("region")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let observed = self.describe(&RemoteId::key_pair(&key_name)).await?;
        if observed.exists() {
            Ok(Completion::Applied)
        } else {
            Err(NodeError::RemoteState(format!(
                "key pair '{key_name}' not found in region {region}"
            )))
        }
    }

    /// Drive PendingAcceptance → Active from the accepter context
    async fn accept(&mut self) -> Result<Completion, NodeError> {
        let entry = self.recorded_entry()?;
        let remote_id = entry.remote_id.clone();
        let observed = self.describe(&remote_id).await?;
        if !observed.exists() {
            return Err(NodeError::RemoteState(format!(
                "peering connection {remote_id} is not visible to {}",
                self.task.context
            )));
        }

        let mut state = self.advance_peering(
            entry.peering_state.unwrap_or(PeeringState::Requested),
            observed.peering,
        );
        if state == PeeringState::Active {
            self.record_peering(state);
            return Ok(Completion::Unchanged);
        }
        if state.is_terminal() {
            return Err(NodeError::RemoteState(format!(
                "peering connection {remote_id} is {state}"
            )));
        }
        if state == PeeringState::Requested {
            let acknowledged = self.await_ready(&remote_id).await?;
            state = self.advance_peering(state, acknowledged.peering);
        }

        let adapter = Arc::clone(&self.task.adapter);
        retry(&self.task.config.retry, &mut self.attempts, "accept_peering", || {
            adapter.accept_peering(&remote_id)
        })
        .await?;

        let config = Arc::clone(&self.task.config);
        let waited = poll_until(&config.poll, config.acceptance_timeout(), || {
            let adapter = Arc::clone(&adapter);
            let remote_id = remote_id.clone();
            async move {
                let observed = adapter.describe(&remote_id).await?;
                Ok(match observed.peering {
                    Some(settled) if settled == PeeringState::Active || settled.is_terminal() => {
                        Probe::Ready(settled)
                    }
                    _ => Probe::Pending,
                })
            }
        })
        .await;

        match waited {
            Ok(PeeringState::Active) => {
                let state = self.advance_peering(state, Some(PeeringState::Active));
                self.record_peering(state);
                Ok(Completion::Applied)
            }
            Ok(terminal) => {
                let state = self.advance_peering(state, Some(terminal));
                self.record_peering(state);
                Err(NodeError::RemoteState(format!(
                    "peering connection {remote_id} is {terminal}"
                )))
            }
            Err(PollError::TimedOut { waited }) => {
                let mut fsm = StateMachineWithHistory::new(state);
                let rejected = match fsm.transition_with_history(PeeringInput::AcceptanceTimedOut, Utc::now()) {
                    Ok(output) => {
                        for warning in &output.warnings {
                            warn!(peering = %self.entity(), warning = %warning, "Peering rejected");
                        }
                        *fsm.current_state()
                    }
                    Err(_) => PeeringState::Rejected,
                };
                self.record_peering(rejected);
                Err(NodeError::AcceptanceTimeout {
                    peering: self.entity().name.clone(),
                    waited_ms: waited.as_millis() as u64,
                })
            }
            Err(PollError::Adapter(error)) => Err(error.into()),
        }
    }

    fn record_peering(&mut self, state: PeeringState) {
        let key = self.entity().clone();
        self.updates.push(SnapshotUpdate::PeeringState {
            key,
            state,
            observed_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimulatedCloud;
    use crate::config::PollPolicy;
    use crate::domain::account::AccountContext;
    use crate::graph::ResourceSpec;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> Arc<ProvisionerConfig> {
        Arc::new(
            ProvisionerConfig::default()
                .with_retry(RetryPolicy {
                    max_attempts: 3,
                    base_delay_ms: 1,
                    max_delay_ms: 2,
                    multiplier: 2.0,
                    jitter: false,
                })
                .with_poll(PollPolicy {
                    initial_interval_ms: 1,
                    max_interval_ms: 2,
                })
                .with_acceptance_timeout(Duration::from_millis(30)),
        )
    }

    fn task(
        cloud: &SimulatedCloud,
        context: &AccountContext,
        key: NodeKey,
        operation: Operation,
        spec: ResourceSpec,
        entry: Option<SnapshotEntry>,
    ) -> NodeTask {
        let fingerprint = Fingerprint::of(key.entity.kind, &spec);
        NodeTask {
            key,
            context: context.name.clone(),
            operation,
            attributes: spec.attributes,
            depends_on: Vec::new(),
            fingerprint: Some(fingerprint),
            entry,
            adapter: Arc::new(cloud.adapter(context)),
            table_lock: None,
            config: fast_config(),
        }
    }

    fn upserted(outcome: &NodeOutcome) -> SnapshotEntry {
        outcome
            .updates
            .iter()
            .find_map(|update| match update {
                SnapshotUpdate::Upsert(entry) => Some(entry.clone()),
                _ => None,
            })
            .expect("an upsert")
    }

    #[tokio::test]
    async fn test_zone_with_foreign_record_is_not_deleted() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let zone = EntityKey::new(EntityKind::DnsZone, "internal");
        let spec = ResourceSpec::default()
            .attribute("domain", "corp.internal")
            .attribute("records", json!([]));

        let created = task(&cloud, &a, NodeKey::provision(zone.clone()), Operation::Create, spec.clone(), None)
            .execute()
            .await;
        assert_eq!(created.result, Ok(Completion::Applied));
        let entry = upserted(&created);

        cloud
            .insert_record(&entry.remote_id, ZoneRecord::new("db.corp.internal", "A", "10.0.1.5"))
            .await;
        let destroyed = task(&cloud, &a, NodeKey::teardown(zone), Operation::Destroy, spec, Some(entry.clone()))
            .execute()
            .await;

        assert!(matches!(destroyed.result, Err(NodeError::Precondition(_))));
        assert!(destroyed.updates.is_empty());
        assert!(cloud.resource(&entry.remote_id).await.is_some());
        assert!(cloud
            .calls()
            .await
            .iter()
            .all(|call| call.call != crate::adapter::CallKind::Delete));
    }

    #[tokio::test]
    async fn test_vanished_resource_is_recreated() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let segment = EntityKey::new(EntityKind::Segment, "vpc");
        let spec = ResourceSpec::default().attribute("cidr", "10.0.0.0/16");

        let created = task(&cloud, &a, NodeKey::provision(segment.clone()), Operation::Create, spec.clone(), None)
            .execute()
            .await;
        let entry = upserted(&created);
        cloud.remove_out_of_band(&entry.remote_id).await;

        let confirmed = task(&cloud, &a, NodeKey::provision(segment), Operation::NoOp, spec, Some(entry.clone()))
            .execute()
            .await;
        assert_eq!(confirmed.result, Ok(Completion::Applied));
        assert_ne!(upserted(&confirmed).remote_id, entry.remote_id);
    }

    #[tokio::test]
    async fn test_missing_key_pair_is_a_state_error() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let spec = ResourceSpec::default()
            .attribute("key_name", "ops")
            .attribute("region", "us-east-1");
        let key = NodeKey::new(EntityKey::key_pair_check("ops", "a"), Step::Verify);

        let outcome = task(&cloud, &a, key, Operation::Verify, spec, None).execute().await;
        match outcome.result {
            Err(NodeError::RemoteState(message)) => assert!(message.contains("us-east-1")),
            other => panic!("expected state error, got {other:?}"),
        }
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_declared_zone_records_are_kept_without_purge() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let zone = EntityKey::new(EntityKind::DnsZone, "internal");
        let spec = ResourceSpec::default()
            .attribute("domain", "corp.internal")
            .attribute("records", json!([ZoneRecord::new("db.corp.internal", "A", "10.0.1.5")]));

        let created = task(&cloud, &a, NodeKey::provision(zone.clone()), Operation::Create, spec.clone(), None)
            .execute()
            .await;
        let entry = upserted(&created);

        let destroyed = task(&cloud, &a, NodeKey::teardown(zone), Operation::Destroy, spec, Some(entry.clone()))
            .execute()
            .await;

        match destroyed.result {
            Err(NodeError::Precondition(message)) => assert!(message.contains("db.corp.internal")),
            other => panic!("expected precondition failure, got {other:?}"),
        }
        assert!(cloud.mutating_calls().await.iter().all(|call| call.call == crate::adapter::CallKind::Create));
        assert!(cloud.resource(&entry.remote_id).await.is_some());
    }

    #[tokio::test]
    async fn test_rejected_peering_fails_without_waiting_out_the_timeout() {
        let cloud = SimulatedCloud::new();
        let a = AccountContext::new("a", "111111111111", "us-east-1");
        let b = AccountContext::new("b", "222222222222", "us-west-2");
        cloud.reject_acceptance().await;
        let pcx = EntityKey::new(EntityKind::PeeringConnection, "pcx");
        let spec = ResourceSpec::default().attribute("accepter_context", "b");

        let created = task(&cloud, &a, NodeKey::provision(pcx.clone()), Operation::Create, spec.clone(), None)
            .execute()
            .await;
        let entry = upserted(&created);

        let mut accept = task(&cloud, &b, NodeKey::new(pcx, Step::Accept), Operation::Accept, spec, Some(entry));
        accept.config = Arc::new((*fast_config()).clone().with_acceptance_timeout(Duration::from_secs(60)));
        let outcome = tokio::time::timeout(Duration::from_secs(5), accept.execute())
            .await
            .expect("accept kept polling a rejected connection");

        assert!(matches!(outcome.result, Err(NodeError::RemoteState(_))));
        assert!(outcome.updates.iter().any(|update| matches!(
            update,
            SnapshotUpdate::PeeringState {
                state: PeeringState::Rejected,
                ..
            }
        )));
    }
}
