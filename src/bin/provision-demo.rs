// Copyright (c) 2025 - Cowboy AI, Inc.
//! Provisioning Demo
//!
//! Applies a topology against the simulated provider twice: the first pass
//! creates everything, the second must be a no-op.
//!
//! Run with: cargo run --bin provision-demo [topology.json]
//!
//! Without an argument the bundled two-account peering topology is used.
//! Set PROVISIONER_SNAPSHOT_PATH to keep the snapshot on disk; otherwise
//! it lives in memory for the duration of the run.

use anyhow::{Context, Result};
use cim_network_provisioner::{
    JsonTopologyLoader, MemorySnapshotStore, Provisioner, ProvisionerConfig,
    ProvisioningService, SimulatedCloud, Topology, TopologyLoader,
};
use tracing::info;

const BUNDLED_TOPOLOGY: &str = include_str!("../../demos/two_account_peering.json");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let loader = match std::env::args().nth(1) {
        Some(path) => JsonTopologyLoader::from_path(path),
        None => JsonTopologyLoader::from_json(BUNDLED_TOPOLOGY),
    };
    let topology = loader.load().await.context("Failed to load topology")?;

    let config = ProvisionerConfig::from_env().context("Invalid provisioner configuration")?;
    let cloud = seeded_cloud(&topology).await;
    let adapters = cloud.registry(&topology.contexts);

    let provisioner: Box<dyn ProvisioningService> =
        if std::env::var_os(cim_network_provisioner::config::env::SNAPSHOT_PATH).is_some() {
            info!(path = %config.snapshot_path.display(), "Using file snapshot store");
            Box::new(Provisioner::with_file_store(config, adapters))
        } else {
            Box::new(Provisioner::new(config, adapters, MemorySnapshotStore::new()))
        };

    for pass in 1..=2 {
        let report = provisioner
            .apply(&topology)
            .await
            .with_context(|| format!("Apply pass {pass} aborted"))?;
        info!(pass, mutations = report.mutations(), "Apply finished");
        println!("{report}");
        if !report.is_success() {
            anyhow::bail!("Apply pass {pass} finished with failures");
        }
    }

    info!(calls = cloud.call_count().await, "Simulated provider calls");
    Ok(())
}

/// Simulated provider with every declared key pair present in its region
async fn seeded_cloud(topology: &Topology) -> SimulatedCloud {
    let cloud = SimulatedCloud::new();
    for key_pair in &topology.key_pairs {
        for context in topology.contexts.iter().filter(|c| c.region == key_pair.region) {
            cloud.add_key_pair(&context.name, &key_pair.key_name).await;
        }
    }
    cloud
}
