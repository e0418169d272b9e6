// Copyright (c) 2025 - Cowboy AI, Inc.
//! Peering Handshake State Machine
//!
//! Formal FSM for the requester/accepter lifecycle of a cross-account
//! peering connection.
//!
//! # State Machine Type
//!
//! This is a **Mealy Machine**: outputs depend on both state and input.
//!
//! # States
//!
//! - Requested: created by the requester context's adapter call
//! - PendingAcceptance: the provider acknowledged the request
//! - Active: accepted on the accepter context; routes may use it
//! - Rejected: refused, or acceptance not observed in time (terminal)
//! - Deleted: removed from either side (terminal)
//!
//! # Inputs
//!
//! - Acknowledge: Requested → PendingAcceptance
//! - Accept: PendingAcceptance → Active
//! - Reject / AcceptanceTimedOut: any non-terminal → Rejected
//! - Delete: any non-terminal → Deleted
//! - Observe: stay in current state (idempotent re-observation)

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{StateMachine, TransitionError, TransitionResult};

/// Handshake state of a peering connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeeringState {
    Requested,
    PendingAcceptance,
    Active,
    Rejected,
    Deleted,
}

impl PeeringState {
    /// Rejected and Deleted admit no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeeringState::Rejected | PeeringState::Deleted)
    }

    /// Only an active connection may carry routes
    pub fn allows_routes(&self) -> bool {
        matches!(self, PeeringState::Active)
    }

    /// Inputs that move this state forward to `target`, if it is reachable
    ///
    /// Used when an observation jumps ahead of the locally recorded state,
    /// e.g. an externally accepted connection seen as Active right after
    /// creation.
    pub fn inputs_toward(&self, target: PeeringState) -> Vec<PeeringInput> {
        use PeeringState::*;
        match (self, target) {
            (from, to) if *from == to => Vec::new(),
            (Requested, PendingAcceptance) => vec![PeeringInput::Acknowledge],
            (Requested, Active) => vec![PeeringInput::Acknowledge, PeeringInput::Accept],
            (PendingAcceptance, Active) => vec![PeeringInput::Accept],
            (from, Rejected) if !from.is_terminal() => vec![PeeringInput::Reject],
            (from, Deleted) if !from.is_terminal() => vec![PeeringInput::Delete],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for PeeringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeeringState::Requested => "requested",
            PeeringState::PendingAcceptance => "pending-acceptance",
            PeeringState::Active => "active",
            PeeringState::Rejected => "rejected",
            PeeringState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Handshake input (FSM input)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeeringInput {
    /// Provider confirmed the request exists
    Acknowledge,

    /// Accepter context accepted the request
    Accept,

    /// Accepter refused the request
    Reject,

    /// No acceptance within the configured bounded wait
    AcceptanceTimedOut,

    /// Removal from either context
    Delete,

    /// Re-observation without change
    Observe,
}

/// Transition output with metadata
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeeringTransitionOutput {
    /// Warnings generated during transition
    pub warnings: Vec<String>,

    /// Whether dependent routes are permanently blocked by this transition
    pub is_critical: bool,

    /// Whether dependent routes may now be scheduled
    pub routes_unblocked: bool,
}

impl PeeringTransitionOutput {
    fn ok() -> Self {
        Self::default()
    }

    fn unblocked() -> Self {
        Self {
            routes_unblocked: true,
            ..Self::default()
        }
    }

    fn critical(warning: impl Into<String>) -> Self {
        Self {
            warnings: vec![warning.into()],
            is_critical: true,
            routes_unblocked: false,
        }
    }
}

impl StateMachine for PeeringState {
    type Input = PeeringInput;
    type Output = PeeringTransitionOutput;

    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)> {
        use PeeringInput::*;
        use PeeringState::*;

        match (self, input) {
            (state, Observe) => Ok((*state, PeeringTransitionOutput::ok())),

            // Terminal states
            (Rejected | Deleted, _) => Err(TransitionError::InvalidTransition {
                from: self.to_string(),
                to: "any state".to_string(),
            }),

            // Requested
            (Requested, Acknowledge) => Ok((PendingAcceptance, PeeringTransitionOutput::ok())),
            (Requested, Accept) => Err(TransitionError::PreconditionFailed(
                "request has not been acknowledged by the provider".to_string(),
            )),

            // PendingAcceptance
            (PendingAcceptance, Acknowledge) => {
                Ok((PendingAcceptance, PeeringTransitionOutput::ok()))
            }
            (PendingAcceptance, Accept) => Ok((Active, PeeringTransitionOutput::unblocked())),

            // Active
            (Active, Acknowledge) => Ok((Active, PeeringTransitionOutput::ok())),
            (Active, Accept) => Err(TransitionError::BusinessRuleViolation(
                "Already active".to_string(),
            )),
            (Active, AcceptanceTimedOut) => Err(TransitionError::InvalidTransition {
                from: "active".to_string(),
                to: "rejected (via timeout)".to_string(),
            }),

            // Exits to terminal states
            (_, Reject) => Ok((
                Rejected,
                PeeringTransitionOutput::critical("peering request rejected by accepter"),
            )),
            (_, AcceptanceTimedOut) => Ok((
                Rejected,
                PeeringTransitionOutput::critical("acceptance not observed within the bounded wait"),
            )),
            (_, Delete) => Ok((Deleted, PeeringTransitionOutput::ok())),
        }
    }

    fn valid_inputs(&self) -> Vec<Self::Input> {
        use PeeringInput::*;
        use PeeringState::*;

        match self {
            Requested => vec![Acknowledge, Reject, AcceptanceTimedOut, Delete, Observe],
            PendingAcceptance => vec![Acknowledge, Accept, Reject, AcceptanceTimedOut, Delete, Observe],
            Active => vec![Acknowledge, Reject, Delete, Observe],
            Rejected | Deleted => vec![Observe],
        }
    }
}
