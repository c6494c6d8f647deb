//! Command Request State Machine
//!
//! Defines the lifecycle of a command request and which transitions are
//! valid between its states.

use std::fmt;
use thiserror::Error;

/// Why a request ended without being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// No reply within the deadline on the final attempt
    Timeout,
    /// The agent explicitly refused the command
    Rejected,
    /// The agent was deregistered or its network was torn down
    AgentGone,
    /// The caller cancelled the request
    Cancelled,
    /// The transport refused the frame on the final attempt
    Transport,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Rejected => "rejected",
            FailureReason::AgentGone => "agent_gone",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Transport => "transport",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a command request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting in the agent's queue
    Queued,
    /// Handed to the transport
    Sent,
    /// Transmitted; waiting for the agent's reply
    AwaitingAck,
    /// Reply did not arrive in time; resolved to Queued or Failed at once
    TimedOut,
    /// Reply accepted, or fire-and-forget frame transmitted
    Acked,
    Failed(FailureReason),
    Cancelled,
}

impl RequestState {
    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Acked | RequestState::Failed(_) | RequestState::Cancelled
        )
    }
}

/// Error for a transition that the lifecycle does not allow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid request transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RequestState,
    pub to: RequestState,
}

/// Check if a transition from one state to another is valid
pub fn is_valid_transition(from: RequestState, to: RequestState) -> bool {
    use RequestState::*;

    match (from, to) {
        // Nothing leaves a terminal state
        (a, _) if a.is_terminal() => false,

        (Queued, Sent) => true,
        (Sent, AwaitingAck) => true,
        // Fire-and-forget completes on transmission
        (Sent, Acked) => true,
        // Transport refused the frame
        (Sent, Queued) | (Sent, Failed(_)) => true,

        (AwaitingAck, Acked) => true,
        (AwaitingAck, Failed(_)) => true,
        (AwaitingAck, TimedOut) => true,

        (TimedOut, Queued) => true,
        (TimedOut, Failed(FailureReason::Timeout)) => true,

        // Cancellation and deregistration apply to every pending state
        (Queued | Sent | AwaitingAck, Cancelled) => true,
        (Queued, Failed(FailureReason::AgentGone)) => true,

        _ => false,
    }
}

/// Validate and describe a transition
pub fn transition(from: RequestState, to: RequestState) -> Result<RequestState, InvalidTransition> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(InvalidTransition { from, to })
    }
}
