// Copyright (c) 2025 - Cowboy AI, Inc.
//! Finite State Machine Abstractions
//!
//! Generic, reusable state machine types for the provisioner's lifecycles.
//! Transitions are pure: `(State, Input) → (State, Output)` with no side
//! effects, so the scheduler decides *when* to feed an input and the
//! machine decides *whether* the input is legal.
//!
//! # Machines in this crate
//!
//! - [`peering::PeeringState`]: requester/accepter handshake of a peering
//!   connection (Mealy: the output says whether dependent routes unblock)
//! - [`node_lifecycle::NodePhase`]: lifecycle of one execution node in the
//!   scheduler
//!
//! # Example
//!
//! ```rust
//! use cim_network_provisioner::state_machine::peering::{PeeringInput, PeeringState};
//! use cim_network_provisioner::state_machine::StateMachine;
//!
//! let (state, _) = PeeringState::Requested
//!     .transition(&PeeringInput::Acknowledge)
//!     .unwrap();
//! let (state, output) = state.transition(&PeeringInput::Accept).unwrap();
//! assert_eq!(state, PeeringState::Active);
//! assert!(output.routes_unblocked);
//! ```

use chrono::{DateTime, Utc};

pub mod node_lifecycle;
pub mod peering;

/// Result of a state transition
pub type TransitionResult<S> = Result<S, TransitionError>;

/// Why an input was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// No edge for this (state, input) pair
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The edge exists but the lifecycle forbids taking it now
    #[error("Business rule violated: {0}")]
    BusinessRuleViolation(String),
}

/// A pure Mealy machine over `Self` as the state
pub trait StateMachine: Sized + Clone {
    type Input;

    /// Produced alongside the next state (use `()` if none)
    type Output;

    /// Next state and output, or why `input` is illegal here
    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)>;

    fn can_transition(&self, input: &Self::Input) -> bool {
        self.transition(input).is_ok()
    }

    /// Inputs accepted from this state, for machines with a finite input set
    fn valid_inputs(&self) -> Vec<Self::Input>
    where
        Self::Input: Clone,
    {
        Vec::new()
    }
}

/// One accepted transition
#[derive(Debug, Clone)]
pub struct TransitionRecord<S, I> {
    pub from: S,
    pub to: S,
    pub input: I,
    pub at: DateTime<Utc>,
}

/// A machine plus the ordered record of every transition it accepted
///
/// The worker replays observed handshake states through one of these and
/// logs each recorded step.
#[derive(Debug, Clone)]
pub struct StateMachineWithHistory<M: StateMachine> {
    current: M,
    history: Vec<TransitionRecord<M, M::Input>>,
}

impl<M: StateMachine> StateMachineWithHistory<M> {
    pub fn new(initial: M) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    /// Feed `input`; a refused input leaves state and history untouched
    pub fn transition_with_history(
        &mut self,
        input: M::Input,
        at: DateTime<Utc>,
    ) -> TransitionResult<M::Output> {
        let (next, output) = self.current.transition(&input)?;
        let from = std::mem::replace(&mut self.current, next.clone());
        self.history.push(TransitionRecord {
            from,
            to: next,
            input,
            at,
        });
        Ok(output)
    }

    pub fn get_history(&self) -> &[TransitionRecord<M, M::Input>] {
        &self.history
    }

    pub fn current_state(&self) -> &M {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::peering::{PeeringInput, PeeringState};
    use super::*;

    #[test]
    fn test_history_records_accepted_transitions_only() {
        let mut fsm = StateMachineWithHistory::new(PeeringState::Requested);

        // Accept before acknowledgement is rejected and not recorded
        assert!(fsm
            .transition_with_history(PeeringInput::Accept, Utc::now())
            .is_err());
        assert!(fsm.get_history().is_empty());

        fsm.transition_with_history(PeeringInput::Acknowledge, Utc::now())
            .unwrap();
        fsm.transition_with_history(PeeringInput::Accept, Utc::now())
            .unwrap();

        assert_eq!(*fsm.current_state(), PeeringState::Active);
        let history = fsm.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, PeeringState::Requested);
        assert_eq!(history[1].to, PeeringState::Active);
    }
}
