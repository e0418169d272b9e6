// Copyright (c) 2025 - Cowboy AI, Inc.
//! Apply Report
//!
//! The caller-facing record of one apply pass: one entry per executed
//! node in topological order plus summary counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::kind::EntityKey;
use crate::graph::{NodeKey, Step};
use crate::reconcile::Operation;

/// Why a node was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Remote state already matched
    NoOp,
    /// Cancellation arrived before the node started
    Cancelled,
}

/// Final status of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed { reason: String },
    /// Never attempted because `by` failed
    Blocked { by: NodeKey },
    Skipped { reason: SkipReason },
}

impl NodeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Skipped { reason: SkipReason::NoOp })
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Succeeded => f.write_str("succeeded"),
            NodeStatus::Failed { reason } => write!(f, "failed: {reason}"),
            NodeStatus::Blocked { by } => write!(f, "blocked by {by}"),
            NodeStatus::Skipped { reason: SkipReason::NoOp } => f.write_str("skipped (no-op)"),
            NodeStatus::Skipped { reason: SkipReason::Cancelled } => f.write_str("skipped (cancelled)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub entity: EntityKey,
    pub step: Step,
    pub context: String,
    pub operation: Operation,
    #[serde(flatten)]
    pub status: NodeStatus,
    /// Remote call attempts spent, retries included
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReportEntry {
    pub fn node_key(&self) -> NodeKey {
        NodeKey::new(self.entity.clone(), self.step)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
}

impl ReportSummary {
    pub fn from_entries(entries: &[ReportEntry]) -> Self {
        entries
            .iter()
            .fold(Self::default(), |mut summary, entry| {
                match entry.status {
                    NodeStatus::Succeeded => summary.succeeded += 1,
                    NodeStatus::Failed { .. } => summary.failed += 1,
                    NodeStatus::Blocked { .. } => summary.blocked += 1,
                    NodeStatus::Skipped { .. } => summary.skipped += 1,
                }
                summary
            })
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.blocked + self.skipped
    }
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} blocked, {} skipped",
            self.succeeded, self.failed, self.blocked, self.skipped
        )
    }
}

/// Outcome of one apply pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub apply_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub entries: Vec<ReportEntry>,
    pub summary: ReportSummary,
}

impl ApplyReport {
    pub fn new(
        started_at: DateTime<Utc>,
        entries: Vec<ReportEntry>,
        cancelled: bool,
    ) -> Self {
        let summary = ReportSummary::from_entries(&entries);
        Self {
            apply_id: Uuid::now_v7(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
            entries,
            summary,
        }
    }

    /// Every node succeeded or was a no-op
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.entries.iter().all(|entry| entry.status.is_success())
    }

    pub fn entry(&self, entity: &EntityKey, step: Step) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|entry| entry.entity == *entity && entry.step == step)
    }

    /// Status of the provision step of `entity`
    pub fn status_of(&self, entity: &EntityKey) -> Option<&NodeStatus> {
        self.entry(entity, Step::Provision).map(|entry| &entry.status)
    }

    /// Number of nodes that changed remote state
    pub fn mutations(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.operation.is_mutation() && entry.status == NodeStatus::Succeeded)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "apply {} ({})", self.apply_id, self.summary)?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {:<10} {:<48} [{}] {}",
                entry.operation.to_string(),
                entry.node_key().to_string(),
                entry.context,
                entry.status
            )?;
        }
        if self.cancelled {
            writeln!(f, "  (cancelled)")?;
        }
        Ok(())
    }
}
