// SPDX-License-Identifier: Apache-2.0

//! Handler state machine with typed state transitions.
//!
//! Implements the sandbox lifecycle: Uninitialized → {Stopped, Running,
//! Paused} on first use (reconciled against the runtime), then
//! restart/unpause/pause/stop transitions driven by the invocation path and
//! the evictor. Invalid transitions result in StateTransitionError.

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::HandlerName;

/// Handler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerState {
    /// Handler registered but its sandbox has never been probed.
    Uninitialized,

    /// Sandbox exists but is not running; restartable.
    Stopped,

    /// Sandbox is live and serving (or about to serve) requests.
    Running,

    /// Sandbox is frozen between invocations; eligible for eviction.
    Paused,
}

impl HandlerState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Stopped => "Stopped",
            Self::Running => "Running",
            Self::Paused => "Paused",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: HandlerState) -> bool {
        matches!(
            (self, target),
            // From Uninitialized: whatever the runtime reports
            (Self::Uninitialized, Self::Stopped) |
            (Self::Uninitialized, Self::Running) |
            (Self::Uninitialized, Self::Paused) |
            // Restart and unpause
            (Self::Stopped, Self::Running) |
            (Self::Paused, Self::Running) |
            // Pause after the last in-flight request
            (Self::Running, Self::Paused) |
            // Evictor stop
            (Self::Paused, Self::Stopped)
        )
    }
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for a handler's sandbox lifecycle.
/// Enforces valid transitions; the owning Handler serializes access.
#[derive(Debug)]
pub struct HandlerStateMachine {
    handler: HandlerName,
    current_state: HandlerState,
    transition_count: u64,
}

impl HandlerStateMachine {
    /// Create a new state machine for a handler.
    pub fn new(handler: HandlerName) -> Self {
        Self {
            handler,
            current_state: HandlerState::Uninitialized,
            transition_count: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> HandlerState {
        self.current_state
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: HandlerState) -> Result<(), StateTransitionError> {
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                handler: self.handler.clone(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            handler = %self.handler,
            from = self.current_state.name(),
            to = target.name(),
            "state transition"
        );

        self.current_state = target;
        self.transition_count += 1;

        Ok(())
    }
}
