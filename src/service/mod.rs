// Copyright (c) 2025 - Cowboy AI, Inc.
//! Service Layer for Network Provisioning
//!
//! Orchestrates the pure layers (graph builder, validator, reconciler)
//! and the effectful ones (scheduler, snapshot store).
//!
//! # Architecture
//!
//! ```text
//! Topology (loader)
//!     ↓
//! Dependency Graph Builder ── typed references, cycles, premature routes
//!     ↓
//! Route & CIDR Validator ── pre-flight gate
//!     ↓
//! Reconciliation ── snapshot diff, one operation per node
//!     ↓
//! Execution Scheduler ── per-context pools, retries, handshake
//!     ↓
//! Cloud Provider Adapters
//!     ↓
//! Snapshot Store (atomic rewrite) + Apply Report
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use cim_network_provisioner::service::{Provisioner, ProvisioningService};
//!
//! let provisioner = Provisioner::with_file_store(config, adapters);
//! let report = provisioner.apply(&topology).await?;
//! println!("{report}");
//! ```

pub mod provisioner;

pub use provisioner::{Provisioner, ProvisioningService};
