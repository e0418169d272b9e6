// Copyright (c) 2025 - Cowboy AI, Inc.
//! Topology Loading
//!
//! The provisioner consumes an already parsed entity set. The JSON loader
//! covers files and inline documents; other declaration formats plug in
//! behind [`TopologyLoader`].

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::topology::Topology;
use crate::errors::ProvisioningResult;

#[async_trait]
pub trait TopologyLoader: Send + Sync {
    async fn load(&self) -> ProvisioningResult<Topology>;
}

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Inline(String),
}

/// Reads the serde form of [`Topology`]
#[derive(Debug, Clone)]
pub struct JsonTopologyLoader {
    source: Source,
}

impl JsonTopologyLoader {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::File(path.into()),
        }
    }

    pub fn from_json(document: impl Into<String>) -> Self {
        Self {
            source: Source::Inline(document.into()),
        }
    }
}

#[async_trait]
impl TopologyLoader for JsonTopologyLoader {
    async fn load(&self) -> ProvisioningResult<Topology> {
        let topology: Topology = match &self.source {
            Source::File(path) => {
                let bytes = tokio::fs::read(path).await?;
                serde_json::from_slice(&bytes)?
            }
            Source::Inline(document) => serde_json::from_str(document)?,
        };
        debug!(
            contexts = topology.contexts.len(),
            segments = topology.segments.len(),
            peerings = topology.peerings.len(),
            "Topology loaded"
        );
        Ok(topology)
    }
}
