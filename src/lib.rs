// Copyright (c) 2025 - Cowboy AI, Inc.
//! Multi-account network provisioner
//!
//! Realizes a declared network topology (segments, subnets, routing,
//! cross-account peering, security rules, compute instances and DNS zones)
//! against cloud providers, idempotently. Each apply pass builds a typed
//! dependency graph, validates routing and CIDR invariants, reconciles the
//! model against the last persisted snapshot, executes the resulting plan
//! under per-context concurrency limits, and writes the snapshot back.

pub mod adapter;
pub mod config;
pub mod domain;
pub mod errors;
pub mod graph;
pub mod loader;
pub mod reconcile;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod state_machine;

// Re-export commonly used types
pub use adapter::{AdapterError, AdapterRegistry, CloudProviderAdapter, RemoteId, SimulatedCloud};
pub use config::{PollPolicy, ProvisionerConfig, RetryPolicy};
pub use domain::{AccountContext, Topology};
pub use errors::{ProvisioningError, ProvisioningResult};
pub use loader::{JsonTopologyLoader, TopologyLoader};
pub use reconcile::{ExecutionPlan, FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use report::{ApplyReport, NodeStatus, ReportSummary};
pub use scheduler::{CancellationHandle, CancellationToken, Scheduler};
pub use service::{Provisioner, ProvisioningService};
