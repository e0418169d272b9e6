// Copyright (c) 2025 - Cowboy AI, Inc.
//! Simulated Cloud
//!
//! An in-process provider shared by every account context. It behaves
//! like a strict cloud API where the provisioner relies on it:
//!
//! - resources are only visible to their owning context; a peering
//!   connection is also visible to its accepter
//! - a peering request is acknowledged on its first observation and
//!   becomes active only through `accept_peering` on the accepter context
//! - a route over a peering connection that is not active is refused
//! - instances need their key pair to exist in the launching context
//! - nothing can be deleted while another resource still references it
//! - a DNS zone holding non-system records refuses deletion
//!
//! Fault injection covers transient failures, state failures, slow or
//! ignored or rejected acceptance and slow instance readiness. Every call
//! is recorded with its start and finish instants, along with concurrency
//! high-water marks per context and per route table.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{
    AdapterError, AdapterRegistry, Attributes, CloudProviderAdapter, RemoteId, RemoteState,
    RemoteStatus,
};
use crate::domain::account::AccountContext;
use crate::domain::kind::EntityKind;
use crate::domain::topology::ZoneRecord;
use crate::state_machine::peering::PeeringState;

/// Adapter operation, for fault targeting and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallKind {
    Create,
    Describe,
    Update,
    Delete,
    AcceptPeering,
}

impl CallKind {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, CallKind::Describe)
    }
}

/// One adapter call as seen by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub context: String,
    pub call: CallKind,
    pub kind: Option<EntityKind>,
    pub remote_id: Option<RemoteId>,
    /// Request body of create and update calls
    pub attributes: Option<Attributes>,
    pub started_at: Instant,
    /// Set once the simulated latency has elapsed
    pub finished_at: Option<Instant>,
}

impl RecordedCall {
    /// Whether both calls were in flight at the same moment
    pub fn overlaps(&self, other: &RecordedCall) -> bool {
        match (self.finished_at, other.finished_at) {
            (Some(self_end), Some(other_end)) => {
                self.started_at < other_end && other.started_at < self_end
            }
            _ => false,
        }
    }
}

/// A resource held by the simulated provider
#[derive(Debug, Clone, PartialEq)]
pub struct SimResource {
    pub kind: EntityKind,
    /// Owning account context
    pub owner: String,
    pub attributes: Attributes,
    pub status: RemoteStatus,
    pub peering: Option<PeeringState>,
    /// Accepter context, for peering connections
    pub accepter: Option<String>,
    pub records: Vec<ZoneRecord>,
    describes_until_ready: u32,
    describes_until_active: Option<u32>,
}

impl SimResource {
    fn visible_to(&self, context: &str) -> bool {
        self.owner == context || self.accepter.as_deref() == Some(context)
    }

    fn references(&self, id: &RemoteId) -> bool {
        self.attributes
            .iter()
            .any(|(field, value)| field.ends_with("_id") && value.as_str() == Some(id.as_str()))
    }
}

#[derive(Debug, Clone)]
struct FaultKey {
    context: String,
    call: CallKind,
    kind: Option<EntityKind>,
}

impl FaultKey {
    fn matches(&self, context: &str, call: CallKind, kind: Option<EntityKind>) -> bool {
        self.context == context && self.call == call && self.kind.map_or(true, |k| Some(k) == kind)
    }
}

#[derive(Debug, Default)]
struct Faults {
    transient: Vec<(FaultKey, u32)>,
    state: Vec<(FaultKey, String)>,
    acceptance_lag: u32,
    ignore_acceptance: bool,
    reject_acceptance: bool,
    readiness_lag: u32,
}

impl Faults {
    fn check(
        &mut self,
        context: &str,
        call: CallKind,
        kind: Option<EntityKind>,
    ) -> Result<(), AdapterError> {
        if let Some((_, message)) = self
            .state
            .iter()
            .find(|(key, _)| key.matches(context, call, kind))
        {
            return Err(AdapterError::State(message.clone()));
        }
        if let Some((_, remaining)) = self
            .transient
            .iter_mut()
            .find(|(key, remaining)| *remaining > 0 && key.matches(context, call, kind))
        {
            *remaining -= 1;
            return Err(AdapterError::Transient(format!(
                "simulated throttling on {call:?} in {context}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CloudState {
    resources: BTreeMap<RemoteId, SimResource>,
    /// (context, key name)
    key_pairs: BTreeSet<(String, String)>,
    faults: Faults,
    calls: Vec<RecordedCall>,
    in_flight: BTreeMap<String, usize>,
    max_in_flight: BTreeMap<String, usize>,
    /// Writes in flight per route table remote id
    table_writes: BTreeMap<String, usize>,
    max_table_writes: BTreeMap<String, usize>,
}

impl CloudState {
    /// Route table written by a mutating call on one of its entries or associations
    fn table_written(
        &self,
        call: CallKind,
        kind: Option<EntityKind>,
        remote_id: Option<&RemoteId>,
        attributes: Option<&Attributes>,
    ) -> Option<String> {
        if !call.is_mutation()
            || !matches!(
                kind,
                Some(EntityKind::RouteEntry | EntityKind::RouteTableAssociation)
            )
        {
            return None;
        }
        attributes
            .and_then(|attributes| str_attr(attributes, "route_table_id"))
            .or_else(|| {
                remote_id
                    .and_then(|id| self.resources.get(id))
                    .and_then(|resource| str_attr(&resource.attributes, "route_table_id"))
            })
            .map(str::to_string)
    }
}

/// Shared simulated provider; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<Mutex<CloudState>>,
    latency: Duration,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, so overlapping calls become observable
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adapter authenticated against `context`
    pub fn adapter(&self, context: &AccountContext) -> SimulatedAdapter {
        SimulatedAdapter {
            cloud: self.clone(),
            context: context.clone(),
        }
    }

    /// Registry with one adapter per context
    pub fn registry<'a>(&self, contexts: impl IntoIterator<Item = &'a AccountContext>) -> AdapterRegistry {
        contexts
            .into_iter()
            .fold(AdapterRegistry::new(), |registry, context| {
                registry.with(Arc::new(self.adapter(context)))
            })
    }

    /// Make key material `key_name` exist in `context`
    pub async fn add_key_pair(&self, context: &str, key_name: &str) {
        let mut state = self.state.lock().await;
        state
            .key_pairs
            .insert((context.to_string(), key_name.to_string()));
    }

    /// Fail the next `times` matching calls with a transient error
    pub async fn fail_transiently(
        &self,
        context: &str,
        call: CallKind,
        kind: Option<EntityKind>,
        times: u32,
    ) {
        let key = FaultKey {
            context: context.to_string(),
            call,
            kind,
        };
        self.state.lock().await.faults.transient.push((key, times));
    }

    /// Fail every matching call with a state error
    pub async fn fail_with_state(
        &self,
        context: &str,
        call: CallKind,
        kind: Option<EntityKind>,
        message: &str,
    ) {
        let key = FaultKey {
            context: context.to_string(),
            call,
            kind,
        };
        self.state
            .lock()
            .await
            .faults
            .state
            .push((key, message.to_string()));
    }

    /// Observations needed after `accept_peering` before the connection is active
    pub async fn set_acceptance_lag(&self, describes: u32) {
        self.state.lock().await.faults.acceptance_lag = describes;
    }

    /// Accept calls succeed but never take effect
    pub async fn ignore_acceptance(&self) {
        self.state.lock().await.faults.ignore_acceptance = true;
    }

    /// The accepter's account turns every pending request down
    pub async fn reject_acceptance(&self) {
        self.state.lock().await.faults.reject_acceptance = true;
    }

    /// Observations needed before a new instance reports available
    pub async fn set_readiness_lag(&self, describes: u32) {
        self.state.lock().await.faults.readiness_lag = describes;
    }

    /// Add a record to a zone behind the provisioner's back
    pub async fn insert_record(&self, zone: &RemoteId, record: ZoneRecord) -> bool {
        let mut state = self.state.lock().await;
        match state.resources.get_mut(zone) {
            Some(resource) if resource.kind == EntityKind::DnsZone => {
                resource.records.push(record);
                true
            }
            _ => false,
        }
    }

    /// Delete a resource behind the provisioner's back
    pub async fn remove_out_of_band(&self, id: &RemoteId) -> bool {
        self.state.lock().await.resources.remove(id).is_some()
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    /// Calls that could change provider state
    pub async fn mutating_calls(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.call.is_mutation())
            .cloned()
            .collect()
    }

    /// Most calls ever in flight at once for `context`
    pub async fn max_concurrency(&self, context: &str) -> usize {
        self.state
            .lock()
            .await
            .max_in_flight
            .get(context)
            .copied()
            .unwrap_or(0)
    }

    /// Most writes ever in flight at once against route table `table`
    pub async fn max_table_concurrency(&self, table: &RemoteId) -> usize {
        self.state
            .lock()
            .await
            .max_table_writes
            .get(table.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub async fn resource(&self, id: &RemoteId) -> Option<SimResource> {
        self.state.lock().await.resources.get(id).cloned()
    }

    pub async fn resources_of_kind(&self, kind: EntityKind) -> Vec<(RemoteId, SimResource)> {
        self.state
            .lock()
            .await
            .resources
            .iter()
            .filter(|(_, resource)| resource.kind == kind)
            .map(|(id, resource)| (id.clone(), resource.clone()))
            .collect()
    }
}

/// Per-context handle onto a [`SimulatedCloud`]
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    cloud: SimulatedCloud,
    context: AccountContext,
}

impl SimulatedAdapter {
    /// Record the call, hold it in flight for the configured latency,
    /// apply faults, then run `op` against the provider state
    async fn call<T>(
        &self,
        call: CallKind,
        kind: Option<EntityKind>,
        remote_id: Option<&RemoteId>,
        attributes: Option<&Attributes>,
        op: impl FnOnce(&mut CloudState, &AccountContext) -> Result<T, AdapterError>,
    ) -> Result<T, AdapterError> {
        let context = self.context.name.as_str();
        let (kind, index, table) = {
            let mut state = self.cloud.state.lock().await;
            let kind = kind.or_else(|| {
                remote_id.and_then(|id| {
                    if id.as_str().starts_with("key-pair:") {
                        Some(EntityKind::KeyPair)
                    } else {
                        state.resources.get(id).map(|r| r.kind)
                    }
                })
            });
            let table = state.table_written(call, kind, remote_id, attributes);
            state.calls.push(RecordedCall {
                context: context.to_string(),
                call,
                kind,
                remote_id: remote_id.cloned(),
                attributes: attributes.cloned(),
                started_at: Instant::now(),
                finished_at: None,
            });
            let index = state.calls.len() - 1;

            let in_flight = state.in_flight.entry(context.to_string()).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let max = state.max_in_flight.entry(context.to_string()).or_default();
            *max = (*max).max(current);

            if let Some(table) = &table {
                let writes = state.table_writes.entry(table.clone()).or_default();
                *writes += 1;
                let current = *writes;
                let max = state.max_table_writes.entry(table.clone()).or_default();
                *max = (*max).max(current);
            }
            (kind, index, table)
        };

        if !self.cloud.latency.is_zero() {
            tokio::time::sleep(self.cloud.latency).await;
        }

        let mut state = self.cloud.state.lock().await;
        if let Some(in_flight) = state.in_flight.get_mut(context) {
            *in_flight = in_flight.saturating_sub(1);
        }
        if let Some(table) = &table {
            if let Some(writes) = state.table_writes.get_mut(table) {
                *writes = writes.saturating_sub(1);
            }
        }
        if let Some(recorded) = state.calls.get_mut(index) {
            recorded.finished_at = Some(Instant::now());
        }
        trace!(context, ?call, ?kind, "simulated call");
        state.faults.check(context, call, kind)?;
        op(&mut *state, &self.context)
    }
}

fn id_prefix(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::AccountContext => "ctx",
        EntityKind::Segment => "vpc",
        EntityKind::Subnet => "subnet",
        EntityKind::RouteTable => "rtb",
        EntityKind::RouteEntry => "route",
        EntityKind::RouteTableAssociation => "rtbassoc",
        EntityKind::InternetGateway => "igw",
        EntityKind::PeeringConnection => "pcx",
        EntityKind::SecurityRule => "sgr",
        EntityKind::KeyPair => "key",
        EntityKind::Instance => "i",
        EntityKind::DnsZone => "zone",
    }
}

fn new_remote_id(kind: EntityKind) -> RemoteId {
    let raw = Uuid::now_v7().simple().to_string();
    let random = &raw[raw.len() - 12..];
    RemoteId(format!("{}-{random}", id_prefix(kind)))
}

fn system_records(domain: &str) -> Vec<ZoneRecord> {
    vec![
        ZoneRecord::new(domain, "SOA", "ns-1.sim. hostmaster.sim. 1 7200 900 1209600 86400"),
        ZoneRecord::new(domain, "NS", "ns-1.sim."),
    ]
}

fn str_attr<'a>(attributes: &'a Attributes, name: &str) -> Option<&'a str> {
    attributes.get(name).and_then(Value::as_str)
}

fn create_resource(
    state: &mut CloudState,
    context: &AccountContext,
    kind: EntityKind,
    attributes: &Attributes,
) -> Result<RemoteId, AdapterError> {
    for (field, value) in attributes {
        if let Some(id) = value.as_str().filter(|_| field.ends_with("_id")) {
            if !state.resources.contains_key(&RemoteId::new(id)) {
                return Err(AdapterError::State(format!(
                    "{field} references {id}, which does not exist"
                )));
            }
        }
    }

    match kind {
        EntityKind::Instance => {
            let key_name = str_attr(attributes, "key_name").unwrap_or_default();
            if !state
                .key_pairs
                .contains(&(context.name.clone(), key_name.to_string()))
            {
                return Err(AdapterError::State(format!(
                    "key pair '{key_name}' does not exist in {}",
                    context.region
                )));
            }
        }
        EntityKind::RouteEntry
            if str_attr(attributes, "target_kind")
                == Some(EntityKind::PeeringConnection.as_str()) =>
        {
            let target = str_attr(attributes, "target_id").map(RemoteId::new);
            let active = target
                .as_ref()
                .and_then(|id| state.resources.get(id))
                .and_then(|peering| peering.peering)
                == Some(PeeringState::Active);
            if !active {
                return Err(AdapterError::State(format!(
                    "peering connection {} is not active",
                    target.map(|id| id.0).unwrap_or_default()
                )));
            }
        }
        _ => {}
    }

    let readiness_lag = state.faults.readiness_lag;
    let mut records = Vec::new();
    if kind == EntityKind::DnsZone {
        records = system_records(str_attr(attributes, "domain").unwrap_or_default());
        if let Some(declared) = attributes.get("records") {
            records.extend(serde_json::from_value::<Vec<ZoneRecord>>(declared.clone()).unwrap_or_default());
        }
    }

    let pending = kind == EntityKind::Instance && readiness_lag > 0;
    let resource = SimResource {
        kind,
        owner: context.name.clone(),
        attributes: attributes.clone(),
        status: if pending {
            RemoteStatus::Pending
        } else {
            RemoteStatus::Available
        },
        peering: (kind == EntityKind::PeeringConnection).then_some(PeeringState::Requested),
        accepter: str_attr(attributes, "accepter_context").map(str::to_string),
        records,
        describes_until_ready: readiness_lag,
        describes_until_active: None,
    };

    let id = new_remote_id(kind);
    state.resources.insert(id.clone(), resource);
    Ok(id)
}

fn describe_resource(state: &mut CloudState, context: &AccountContext, id: &RemoteId) -> RemoteState {
    if let Some(key_name) = id.as_str().strip_prefix("key-pair:") {
        let exists = state
            .key_pairs
            .contains(&(context.name.clone(), key_name.to_string()));
        return RemoteState {
            status: if exists {
                RemoteStatus::Available
            } else {
                RemoteStatus::NotFound
            },
            ..RemoteState::not_found()
        };
    }

    let Some(resource) = state
        .resources
        .get_mut(id)
        .filter(|resource| resource.visible_to(&context.name))
    else {
        return RemoteState::not_found();
    };

    if resource.peering == Some(PeeringState::Requested) {
        resource.peering = Some(PeeringState::PendingAcceptance);
    } else if let Some(remaining) = resource.describes_until_active {
        if remaining == 0 {
            resource.peering = Some(PeeringState::Active);
            resource.describes_until_active = None;
        } else {
            resource.describes_until_active = Some(remaining - 1);
        }
    }

    if resource.status == RemoteStatus::Pending {
        resource.describes_until_ready = resource.describes_until_ready.saturating_sub(1);
        if resource.describes_until_ready == 0 {
            resource.status = RemoteStatus::Available;
        }
    }

    RemoteState {
        status: resource.status,
        attributes: resource.attributes.clone(),
        peering: resource.peering,
        records: resource.records.clone(),
    }
}

#[async_trait]
impl CloudProviderAdapter for SimulatedAdapter {
    fn context(&self) -> &str {
        &self.context.name
    }

    async fn create(
        &self,
        kind: EntityKind,
        attributes: &Attributes,
    ) -> Result<RemoteId, AdapterError> {
        self.call(CallKind::Create, Some(kind), None, Some(attributes), |state, context| {
            create_resource(state, context, kind, attributes)
        })
        .await
    }

    async fn describe(&self, remote_id: &RemoteId) -> Result<RemoteState, AdapterError> {
        self.call(CallKind::Describe, None, Some(remote_id), None, |state, context| {
            Ok(describe_resource(state, context, remote_id))
        })
        .await
    }

    async fn update(
        &self,
        remote_id: &RemoteId,
        attributes: &Attributes,
    ) -> Result<(), AdapterError> {
        self.call(CallKind::Update, None, Some(remote_id), Some(attributes), |state, context| {
            let resource = state
                .resources
                .get_mut(remote_id)
                .filter(|resource| resource.owner == context.name)
                .ok_or_else(|| {
                    AdapterError::State(format!("{remote_id} not found in {}", context.name))
                })?;
            resource
                .attributes
                .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));

            // Zone contents follow the declared record set
            if resource.kind == EntityKind::DnsZone {
                if let Some(declared) = attributes.get("records") {
                    let domain = str_attr(&resource.attributes, "domain").unwrap_or_default();
                    let mut records = system_records(domain);
                    records.extend(
                        serde_json::from_value::<Vec<ZoneRecord>>(declared.clone())
                            .unwrap_or_default(),
                    );
                    resource.records = records;
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, remote_id: &RemoteId) -> Result<(), AdapterError> {
        self.call(CallKind::Delete, None, Some(remote_id), None, |state, context| {
            let resource = state
                .resources
                .get(remote_id)
                .filter(|resource| resource.visible_to(&context.name))
                .ok_or_else(|| {
                    AdapterError::State(format!("{remote_id} not found in {}", context.name))
                })?;

            if let Some((dependent, _)) = state
                .resources
                .iter()
                .find(|(_, other)| other.references(remote_id))
            {
                return Err(AdapterError::State(format!(
                    "{remote_id} is still referenced by {dependent}"
                )));
            }

            if resource.kind == EntityKind::DnsZone {
                let domain = str_attr(&resource.attributes, "domain").unwrap_or_default();
                if resource.records.iter().any(|r| !r.is_system_managed(domain)) {
                    return Err(AdapterError::State(format!(
                        "zone {remote_id} still contains records"
                    )));
                }
            }

            state.resources.remove(remote_id);
            Ok(())
        })
        .await
    }

    async fn accept_peering(&self, remote_id: &RemoteId) -> Result<(), AdapterError> {
        self.call(
            CallKind::AcceptPeering,
            Some(EntityKind::PeeringConnection),
            Some(remote_id),
            None,
            |state, context| {
                let ignore = state.faults.ignore_acceptance;
                let reject = state.faults.reject_acceptance;
                let lag = state.faults.acceptance_lag;
                let peering = state
                    .resources
                    .get_mut(remote_id)
                    .filter(|resource| resource.kind == EntityKind::PeeringConnection)
                    .ok_or_else(|| {
                        AdapterError::State(format!("peering connection {remote_id} not found"))
                    })?;

                if peering.accepter.as_deref() != Some(context.name.as_str()) {
                    return Err(AdapterError::State(format!(
                        "{} is not the accepter of {remote_id}",
                        context.name
                    )));
                }

                match peering.peering {
                    Some(PeeringState::Active) => Ok(()),
                    Some(PeeringState::Requested) => Err(AdapterError::Transient(format!(
                        "peering connection {remote_id} is not visible to the accepter yet"
                    ))),
                    Some(PeeringState::PendingAcceptance) => {
                        if reject {
                            peering.peering = Some(PeeringState::Rejected);
                        } else if !ignore {
                            if lag == 0 {
                                peering.peering = Some(PeeringState::Active);
                            } else {
                                peering.describes_until_active = Some(lag);
                            }
                        }
                        Ok(())
                    }
                    Some(terminal) => Err(AdapterError::State(format!(
                        "peering connection {remote_id} is {terminal}"
                    ))),
                    None => Err(AdapterError::State(format!(
                        "{remote_id} is not a peering connection"
                    ))),
                }
            },
        )
        .await
    }
}
