// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for provisioning runs
//!
//! Structural errors abort a whole apply before any remote call. Errors
//! scoped to one node never surface here; they live in the apply report.

use thiserror::Error;

use crate::domain::invariants::ValidationReport;
use crate::graph::GraphError;
use crate::reconcile::store::SnapshotError;

/// Errors that abort a provisioning run
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// One or more routing/CIDR invariants are violated
    #[error(transparent)]
    Validation(#[from] ValidationReport),

    /// Reference, cycle or premature-route error in the topology
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Snapshot could not be read or written
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Topology source could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Topology or report (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No adapter is registered for a context the plan needs
    #[error("No adapter registered for account context '{0}'")]
    MissingAdapter(String),
}

/// Result type for provisioning runs
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;
