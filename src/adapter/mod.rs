// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cloud Provider Adapter
//!
//! The provider boundary. One adapter instance is bound to exactly one
//! account context, so credentials never cross contexts; the scheduler
//! looks adapters up per node through the [`AdapterRegistry`].
//!
//! Every failure is classified by the adapter:
//! - [`AdapterError::Transient`]: throttling, eventual-consistency lag;
//!   retried with backoff
//! - [`AdapterError::State`]: the request cannot succeed as issued (missing
//!   key pair, wrong context, dependency violation); never retried

pub mod simulated;

pub use simulated::{CallKind, RecordedCall, SimulatedAdapter, SimulatedCloud};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::kind::EntityKind;
use crate::domain::topology::ZoneRecord;
use crate::state_machine::peering::PeeringState;

/// Attribute map handed to the provider
pub type Attributes = BTreeMap<String, Value>;

/// Provider-assigned identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key pairs are looked up by provider-side name
    pub fn key_pair(key_name: &str) -> Self {
        Self(format!("key-pair:{key_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse lifecycle status reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Available,
    NotFound,
}

/// Result of a `describe` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteState {
    pub status: RemoteStatus,
    #[serde(default)]
    pub attributes: Attributes,
    /// Handshake state, for peering connections
    #[serde(default)]
    pub peering: Option<PeeringState>,
    /// Zone contents, for DNS zones
    #[serde(default)]
    pub records: Vec<ZoneRecord>,
}

impl RemoteState {
    pub fn not_found() -> Self {
        Self {
            status: RemoteStatus::NotFound,
            attributes: Attributes::new(),
            peering: None,
            records: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.status != RemoteStatus::NotFound
    }
}

/// Classified provider failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    State(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// Provider operations for one account context
#[async_trait]
pub trait CloudProviderAdapter: Send + Sync {
    /// Account context this adapter is authenticated against
    fn context(&self) -> &str;

    /// Create a resource of `kind`; returns the provider id
    async fn create(&self, kind: EntityKind, attributes: &Attributes)
        -> Result<RemoteId, AdapterError>;

    /// Observe a resource; a missing resource is `RemoteStatus::NotFound`, not an error
    async fn describe(&self, remote_id: &RemoteId) -> Result<RemoteState, AdapterError>;

    /// Mutate a resource in place
    async fn update(&self, remote_id: &RemoteId, attributes: &Attributes)
        -> Result<(), AdapterError>;

    async fn delete(&self, remote_id: &RemoteId) -> Result<(), AdapterError>;

    /// Accept a pending peering request; only valid on the accepter's context
    async fn accept_peering(&self, remote_id: &RemoteId) -> Result<(), AdapterError>;
}

/// Account context name → adapter
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn CloudProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the adapter's own context name
    pub fn register(&mut self, adapter: Arc<dyn CloudProviderAdapter>) {
        self.adapters.insert(adapter.context().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn CloudProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, context: &str) -> Option<Arc<dyn CloudProviderAdapter>> {
        self.adapters.get(context).cloned()
    }

    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("contexts", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
