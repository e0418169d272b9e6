// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-network-provisioner
//!
//! Provides a deterministic two-account topology and a harness wiring it to
//! the simulated provider and an in-memory snapshot store.
//!
//! # Design Principles
//! - Fixtures are the ONLY place that builds the shared topology
//! - Timing knobs are shrunk so retries and bounded waits finish in milliseconds
//! - Tests mutate a fresh copy of the topology, never shared state

#![allow(dead_code)]

use std::time::Duration;

use cim_network_provisioner::adapter::CallKind;
use cim_network_provisioner::config::{PollPolicy, RetryPolicy};
use cim_network_provisioner::domain::{EntityKey, EntityKind, Subnet};
use cim_network_provisioner::reconcile::MemorySnapshotStore;
use cim_network_provisioner::{Provisioner, ProvisionerConfig, SimulatedCloud, Topology};

/// Account A: us-east-1, 10.0.0.0/16. Account B: us-west-2, 10.1.0.0/16.
pub const TWO_ACCOUNT: &str = include_str!("../../demos/two_account_peering.json");

pub fn two_account_topology() -> Topology {
    serde_json::from_str(TWO_ACCOUNT).expect("Invalid topology fixture")
}

pub fn key(kind: EntityKind, name: &str) -> EntityKey {
    EntityKey::new(kind, name)
}

pub fn subnet(name: &str, segment: &str, cidr: &str, zone: &str) -> Subnet {
    Subnet {
        name: name.to_string(),
        segment: segment.to_string(),
        cidr: cidr.to_string(),
        availability_zone: zone.to_string(),
        tags: Default::default(),
    }
}

/// Three attempts, millisecond delays and millisecond polling
pub fn fast_config() -> ProvisionerConfig {
    ProvisionerConfig::default()
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            multiplier: 2.0,
            jitter: false,
        })
        .with_poll(PollPolicy {
            initial_interval_ms: 1,
            max_interval_ms: 5,
        })
        .with_acceptance_timeout(Duration::from_millis(500))
        .with_readiness_timeout(Duration::from_millis(500))
}

/// Simulated provider where the fixture's key pair exists in account A
pub async fn seeded_cloud() -> SimulatedCloud {
    let cloud = SimulatedCloud::new();
    cloud.add_key_pair("a", "deploy").await;
    cloud
}

pub struct Harness {
    pub cloud: SimulatedCloud,
    pub store: MemorySnapshotStore,
    pub provisioner: Provisioner<MemorySnapshotStore>,
}

impl Harness {
    pub fn new(cloud: SimulatedCloud, config: ProvisionerConfig) -> Self {
        Self::for_topology(cloud, config, &two_account_topology())
    }

    /// Adapters registered for every context of `topology`
    pub fn for_topology(cloud: SimulatedCloud, config: ProvisionerConfig, topology: &Topology) -> Self {
        let store = MemorySnapshotStore::new();
        let provisioner = Provisioner::new(config, cloud.registry(&topology.contexts), store.clone());
        Self {
            cloud,
            store,
            provisioner,
        }
    }

    pub async fn seeded() -> Self {
        Self::new(seeded_cloud().await, fast_config())
    }

    /// Position of the first call matching (call, kind) in the call log
    pub async fn position(&self, call: CallKind, kind: EntityKind) -> Option<usize> {
        self.cloud
            .calls()
            .await
            .iter()
            .position(|recorded| recorded.call == call && recorded.kind == Some(kind))
    }

    pub async fn count(&self, call: CallKind, kind: EntityKind) -> usize {
        self.cloud
            .calls()
            .await
            .iter()
            .filter(|recorded| recorded.call == call && recorded.kind == Some(kind))
            .count()
    }
}
