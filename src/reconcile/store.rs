// Copyright (c) 2025 - Cowboy AI, Inc.
//! Snapshot Stores
//!
//! - [`FileSnapshotStore`]: JSON on disk, rewritten atomically (temporary
//!   file in the same directory, synced, then renamed)
//! - [`MemorySnapshotStore`]: shared in-process copy for tests and dry runs

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::snapshot::{Snapshot, SNAPSHOT_VERSION};

/// Snapshot persistence errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("cannot access snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("cannot encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Read at reconciliation start, written after each apply pass
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Current snapshot; empty when nothing was stored yet
    async fn load(&self) -> Result<Snapshot, SnapshotError>;

    /// Replace the stored snapshot as a whole
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write `bytes` to `temp`, flush it to disk, then move it over the snapshot
    async fn replace_with(&self, temp: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(temp, &self.path).await
    }

    fn io_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Snapshot, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot yet, starting empty");
                return Ok(Snapshot::default());
            }
            Err(error) => return Err(self.io_error(error)),
        };

        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| self.io_error(error))?;
        }

        let temp = self.temp_path();
        if let Err(error) = self.replace_with(&temp, &bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), error = %cleanup, "Failed to remove temporary snapshot");
                }
            }
            return Err(self.io_error(error));
        }

        debug!(path = %self.path.display(), entries = snapshot.len(), "Snapshot written");
        Ok(())
    }
}

/// In-memory store; clones share the same snapshot
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<RwLock<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Copy of the stored snapshot
    pub async fn current(&self) -> Snapshot {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Snapshot, SnapshotError> {
        Ok(self.current().await)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        *self.inner.write().await = snapshot.clone();
        Ok(())
    }
}
