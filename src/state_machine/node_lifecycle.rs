// Copyright (c) 2025 - Cowboy AI, Inc.
//! Execution Node Lifecycle
//!
//! Phase of one node while the scheduler walks the plan.
//!
//! # States
//!
//! - Pending: waiting for dependencies or a worker
//! - Running: holds a worker permit; remote calls in flight
//! - Succeeded / Failed: finished (terminal)
//! - Blocked: an upstream node failed; never attempted (terminal)
//! - Skipped: no-op or cancelled before it started (terminal)
//!
//! A running node always finishes: cancellation only reaches Pending nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{StateMachine, TransitionError, TransitionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Skipped,
}

impl NodePhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodePhase::Pending | NodePhase::Running)
    }

    /// Whether dependents may start after this phase
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodePhase::Succeeded | NodePhase::Skipped)
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodePhase::Pending => "pending",
            NodePhase::Running => "running",
            NodePhase::Succeeded => "succeeded",
            NodePhase::Failed => "failed",
            NodePhase::Blocked => "blocked",
            NodePhase::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Dependencies satisfied and permit acquired
    Start,
    Succeed,
    /// Finished without a remote change
    Skip,
    Fail,
    /// An upstream node failed
    Block,
    /// Cancellation observed before start
    Cancel,
}

impl StateMachine for NodePhase {
    type Input = NodeEvent;
    type Output = ();

    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)> {
        use NodeEvent::*;
        use NodePhase::*;

        let next = match (self, input) {
            (Pending, Start) => Running,
            (Pending, Block) => Blocked,
            (Pending, Cancel) => Skipped,
            (Running, Succeed) => Succeeded,
            (Running, Skip) => Skipped,
            (Running, Fail) => Failed,
            (Running, Cancel) => {
                return Err(TransitionError::BusinessRuleViolation(
                    "in-flight nodes run to completion".to_string(),
                ))
            }
            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    from: from.to_string(),
                    to: format!("{event:?}"),
                })
            }
        };
        Ok((next, ()))
    }

    fn valid_inputs(&self) -> Vec<Self::Input> {
        match self {
            NodePhase::Pending => vec![NodeEvent::Start, NodeEvent::Block, NodeEvent::Cancel],
            NodePhase::Running => vec![NodeEvent::Succeed, NodeEvent::Skip, NodeEvent::Fail],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(NodePhase::Pending, NodeEvent::Start => Some(NodePhase::Running))]
    #[test_case(NodePhase::Pending, NodeEvent::Block => Some(NodePhase::Blocked))]
    #[test_case(NodePhase::Pending, NodeEvent::Cancel => Some(NodePhase::Skipped))]
    #[test_case(NodePhase::Running, NodeEvent::Fail => Some(NodePhase::Failed))]
    #[test_case(NodePhase::Running, NodeEvent::Cancel => None; "in-flight nodes are not cancelled")]
    #[test_case(NodePhase::Blocked, NodeEvent::Start => None; "blocked nodes never start")]
    #[test_case(NodePhase::Succeeded, NodeEvent::Fail => None)]
    fn test_transitions(from: NodePhase, event: NodeEvent) -> Option<NodePhase> {
        from.transition(&event).ok().map(|(next, _)| next)
    }

    #[test]
    fn test_only_success_and_skip_satisfy_dependents() {
        assert!(NodePhase::Succeeded.satisfies_dependents());
        assert!(NodePhase::Skipped.satisfies_dependents());
        assert!(!NodePhase::Failed.satisfies_dependents());
        assert!(!NodePhase::Blocked.satisfies_dependents());
        assert!(NodePhase::Blocked.is_terminal());
        assert!(!NodePhase::Running.is_terminal());
    }
}
