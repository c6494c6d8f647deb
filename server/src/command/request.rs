//! Command requests and the handles callers wait on

use bytes::Bytes;
use fleetlink_shared::{
    AgentId, CommandPayload, CorrelationKey, ExchangeClass, FailureReason, NetworkId, Priority,
    RequestId, RequestState,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Successful completion of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSuccess {
    pub attempts: u32,
    /// Round-trip time of the answered attempt, absent for fire-and-forget
    pub rtt: Option<Duration>,
}

/// Terminal failure of a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command failed after {attempts} attempt(s): {reason}")]
pub struct CommandFailure {
    pub reason: FailureReason,
    pub attempts: u32,
    /// Reason reported by the agent or the transport, when there is one
    pub detail: Option<String>,
}

impl CommandFailure {
    pub fn new(reason: FailureReason, attempts: u32) -> Self {
        Self {
            reason,
            attempts,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Terminal outcome delivered to the submitter of a command
pub type CommandOutcome = Result<CommandSuccess, CommandFailure>;

/// A unicast command tracked by an agent's queue
#[derive(Debug)]
pub struct CommandRequest {
    pub id: RequestId,
    pub network: NetworkId,
    pub agent: AgentId,
    pub payload: CommandPayload,
    pub priority: Priority,
    pub max_attempts: u32,
    pub attempts_made: u32,
    pub state: RequestState,
    /// Reply deadline of the current attempt
    pub deadline: Option<Instant>,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) cancel_requested: bool,
    responder: Option<oneshot::Sender<CommandOutcome>>,
}

impl CommandRequest {
    /// Create a queued request and the handle its outcome is delivered to
    pub fn new(
        id: RequestId,
        network: NetworkId,
        agent: AgentId,
        payload: CommandPayload,
        priority: Priority,
        max_attempts: u32,
    ) -> (Self, RequestHandle) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id,
            network: network.clone(),
            agent,
            payload,
            priority,
            max_attempts: max_attempts.max(1),
            attempts_made: 0,
            state: RequestState::Queued,
            deadline: None,
            sent_at: None,
            cancel_requested: false,
            responder: Some(tx),
        };
        let handle = RequestHandle {
            request_id: id,
            network,
            agent,
            receiver: rx,
        };
        (request, handle)
    }

    pub fn class(&self) -> ExchangeClass {
        self.payload.class
    }

    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        self.payload.correlation_key
    }

    pub fn body(&self) -> Bytes {
        self.payload.body.clone()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Deliver the outcome to the waiting caller. A caller that stopped
    /// waiting is not an error.
    pub(crate) fn respond(&mut self, outcome: CommandOutcome) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Caller-side handle of a submitted command
#[derive(Debug)]
pub struct RequestHandle {
    pub request_id: RequestId,
    pub network: NetworkId,
    pub agent: AgentId,
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl RequestHandle {
    /// Wait for the terminal outcome of the command.
    ///
    /// If the router holding the request disappears first, the command is
    /// reported as `AgentGone`.
    pub async fn wait(self) -> CommandOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CommandFailure::new(FailureReason::AgentGone, 0)
                .with_detail(format!("network {} closed", self.network))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_receives_outcome() {
        let (mut request, handle) = CommandRequest::new(
            1,
            NetworkId::from("n1"),
            7,
            CommandPayload::fire_and_forget(&b"x"[..]),
            Priority::Normal,
            3,
        );
        request.respond(Ok(CommandSuccess {
            attempts: 1,
            rtt: None,
        }));
        assert_eq!(
            handle.wait().await,
            Ok(CommandSuccess {
                attempts: 1,
                rtt: None
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_request_reports_agent_gone() {
        let (request, handle) = CommandRequest::new(
            1,
            NetworkId::from("n1"),
            7,
            CommandPayload::fire_and_forget(&b"x"[..]),
            Priority::Normal,
            3,
        );
        drop(request);
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::AgentGone);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let (request, _handle) = CommandRequest::new(
            1,
            NetworkId::from("n1"),
            7,
            CommandPayload::fire_and_forget(&b"x"[..]),
            Priority::Normal,
            0,
        );
        assert_eq!(request.max_attempts, 1);
        assert!(request.attempts_remaining());
    }
}
