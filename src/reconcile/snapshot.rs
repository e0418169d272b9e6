// Copyright (c) 2025 - Cowboy AI, Inc.
//! Persisted State Snapshot
//!
//! Last-known remote state per (kind, name): provider id, attribute
//! hashes, observed status, handshake state and the dependencies recorded
//! when the entity was last written. Destroy ordering for entities that
//! left the model comes from those recorded dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::adapter::{RemoteId, RemoteStatus};
use crate::domain::kind::{EntityKey, EntityKind};
use crate::graph::KnownPeeringStates;
use crate::state_machine::peering::PeeringState;

/// Current snapshot format
pub const SNAPSHOT_VERSION: u32 = 1;

/// Last-known state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: EntityKey,
    /// Context whose adapter owns the remote object
    pub context: String,
    pub remote_id: RemoteId,
    pub attribute_hash: String,
    pub immutable_hash: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub peering_state: Option<PeeringState>,
    #[serde(default)]
    pub depends_on: Vec<EntityKey>,
    pub observed_at: DateTime<Utc>,
}

/// Change to apply to a snapshot after a node ran
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotUpdate {
    Upsert(SnapshotEntry),
    Remove(EntityKey),
    /// Handshake progress on an existing peering entry
    PeeringState {
        key: EntityKey,
        state: PeeringState,
        observed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Keyed by `kind/name`
    #[serde(default)]
    pub entries: BTreeMap<String, SnapshotEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            updated_at: None,
            entries: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    pub fn get(&self, key: &EntityKey) -> Option<&SnapshotEntry> {
        self.entries.get(&key.to_string())
    }

    pub fn insert(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.key.to_string(), entry);
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<SnapshotEntry> {
        self.entries.remove(&key.to_string())
    }

    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&mut self, update: SnapshotUpdate) {
        match update {
            SnapshotUpdate::Upsert(entry) => self.insert(entry),
            SnapshotUpdate::Remove(key) => {
                self.remove(&key);
            }
            SnapshotUpdate::PeeringState {
                key,
                state,
                observed_at,
            } => {
                if let Some(entry) = self.entries.get_mut(&key.to_string()) {
                    entry.peering_state = Some(state);
                    entry.observed_at = observed_at;
                }
            }
        }
    }

    /// Handshake states of every recorded peering connection
    pub fn peering_states(&self) -> KnownPeeringStates {
        self.entries()
            .filter(|entry| entry.key.kind == EntityKind::PeeringConnection)
            .filter_map(|entry| entry.peering_state.map(|state| (entry.key.name.clone(), state)))
            .collect()
    }

    /// Entries that recorded a dependency on `key`
    pub fn dependents_of<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a SnapshotEntry> + 'a {
        self.entries()
            .filter(move |entry| entry.depends_on.contains(key))
    }
}
