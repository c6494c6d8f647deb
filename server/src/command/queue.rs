//! Per-agent command queue
//!
//! Holds the pending requests of one agent and drives each through the
//! request lifecycle. At most one request is in flight at a time; the rest
//! wait in priority order. All methods take the current time explicitly so
//! retries and timeouts can be driven by synthetic clocks.

use super::request::{CommandFailure, CommandOutcome, CommandRequest, CommandSuccess};
use bytes::Bytes;
use fleetlink_shared::state_machine::transition;
use fleetlink_shared::{
    AgentId, CorrelationKey, ExchangeClass, FailureReason, Priority, ReplyOutcome, RequestId,
    RequestState,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// The queue already holds its maximum number of pending requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure {
    pub depth: usize,
}

/// A request handed out for transmission
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub request_id: RequestId,
    pub class: ExchangeClass,
    pub body: Bytes,
    pub correlation_key: Option<CorrelationKey>,
    /// 1-based attempt number
    pub attempt: u32,
}

/// A request that reached a terminal state
#[derive(Debug, Clone)]
pub struct FinishedRequest {
    pub request_id: RequestId,
    pub agent: AgentId,
    pub class: ExchangeClass,
    pub state: RequestState,
    pub outcome: CommandOutcome,
}

/// Result of matching a reply against the queue
#[derive(Debug, Clone)]
pub struct ReplyMatch {
    pub finished: FinishedRequest,
    /// Round-trip sample, only taken from first-attempt replies
    pub rtt_sample: Option<(ExchangeClass, Duration)>,
}

/// Bounded queue of pending command requests for one agent
#[derive(Debug)]
pub struct CommandQueue {
    agent: AgentId,
    depth: usize,
    queued: VecDeque<CommandRequest>,
    in_flight: Option<CommandRequest>,
    consecutive_timeouts: u32,
}

impl CommandQueue {
    pub fn new(agent: AgentId, depth: usize) -> Self {
        Self {
            agent,
            depth,
            queued: VecDeque::new(),
            in_flight: None,
            consecutive_timeouts: 0,
        }
    }

    /// Number of requests in Queued, Sent or AwaitingAck
    pub fn pending_len(&self) -> usize {
        self.queued.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    /// Timeouts in a row without any reply from the agent
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Add a request; Urgent requests go after queued Urgent ones and before
    /// every queued Normal request.
    pub fn submit(&mut self, request: CommandRequest) -> Result<(), Backpressure> {
        if self.pending_len() >= self.depth {
            return Err(Backpressure { depth: self.depth });
        }
        let position = match request.priority {
            Priority::Urgent => self.first_normal_position(),
            Priority::Normal => self.queued.len(),
        };
        self.queued.insert(position, request);
        Ok(())
    }

    /// Class of the request that would be dispatched next, if dispatch is
    /// possible right now
    pub fn next_class(&self) -> Option<ExchangeClass> {
        if self.in_flight.is_some() {
            return None;
        }
        self.queued.front().map(CommandRequest::class)
    }

    /// Move the next queued request to Sent, counting an attempt.
    ///
    /// Returns `None` while a request is in flight or nothing is queued.
    pub fn dispatch_next(&mut self) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        let mut request = self.queued.pop_front()?;
        advance(&mut request, RequestState::Sent);
        request.attempts_made += 1;

        let dispatch = Dispatch {
            request_id: request.id,
            class: request.class(),
            body: request.body(),
            correlation_key: request.correlation_key(),
            attempt: request.attempts_made,
        };
        self.in_flight = Some(request);
        Some(dispatch)
    }

    /// The transport accepted the in-flight frame.
    ///
    /// Fire-and-forget requests complete here; others start waiting for the
    /// reply until `now + timeout`.
    pub fn on_transmitted(&mut self, now: Instant, timeout: Duration) -> Option<FinishedRequest> {
        let request = self.in_flight.as_mut()?;
        if request.state != RequestState::Sent {
            return None;
        }

        request.sent_at = Some(now);
        if request.payload.expects_reply() {
            advance(request, RequestState::AwaitingAck);
            request.deadline = Some(now + timeout);
            return None;
        }

        let mut request = self.in_flight.take()?;
        let attempts = request.attempts_made;
        Some(finish(
            &mut request,
            RequestState::Acked,
            Ok(CommandSuccess {
                attempts,
                rtt: None,
            }),
        ))
    }

    /// The transport refused the in-flight frame; counts as a failed attempt
    pub fn on_send_failed(&mut self, detail: &str) -> Option<FinishedRequest> {
        let mut request = self.in_flight.take()?;

        if request.attempts_remaining() {
            debug!(
                agent = self.agent,
                request = request.id,
                attempt = request.attempts_made,
                error = detail,
                "Send failed, requeueing"
            );
            advance(&mut request, RequestState::Queued);
            self.requeue(request);
            return None;
        }

        let attempts = request.attempts_made;
        warn!(
            agent = self.agent,
            request = request.id,
            attempts,
            error = detail,
            "Command failed: transport refused final attempt"
        );
        Some(finish(
            &mut request,
            RequestState::Failed(FailureReason::Transport),
            Err(CommandFailure::new(FailureReason::Transport, attempts).with_detail(detail)),
        ))
    }

    /// Apply pending cancellations and expire an overdue in-flight request.
    ///
    /// A timed-out request goes back to the head of its priority class while
    /// attempts remain; otherwise it fails with `Timeout`.
    pub fn on_tick(&mut self, now: Instant) -> Vec<FinishedRequest> {
        let mut finished = self.apply_cancellations();

        let overdue = matches!(
            &self.in_flight,
            Some(request) if request.state == RequestState::AwaitingAck
                && request.deadline.is_some_and(|deadline| now > deadline)
        );
        if !overdue {
            return finished;
        }

        let Some(mut request) = self.in_flight.take() else {
            return finished;
        };
        advance(&mut request, RequestState::TimedOut);
        request.deadline = None;
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);

        if request.attempts_remaining() {
            debug!(
                agent = self.agent,
                request = request.id,
                attempt = request.attempts_made,
                max_attempts = request.max_attempts,
                "Command timed out, retrying"
            );
            advance(&mut request, RequestState::Queued);
            self.requeue(request);
        } else {
            let attempts = request.attempts_made;
            warn!(
                agent = self.agent,
                request = request.id,
                attempts,
                "Command failed: no reply"
            );
            finished.push(finish(
                &mut request,
                RequestState::Failed(FailureReason::Timeout),
                Err(CommandFailure::new(FailureReason::Timeout, attempts)),
            ));
        }

        finished
    }

    /// Match a reply against the request awaiting it.
    ///
    /// Returns `None` if no request is awaiting a reply with this key.
    pub fn on_reply(
        &mut self,
        key: CorrelationKey,
        outcome: &ReplyOutcome,
        now: Instant,
    ) -> Option<ReplyMatch> {
        let matches = matches!(
            &self.in_flight,
            Some(request) if request.state == RequestState::AwaitingAck
                && request.correlation_key() == Some(key)
        );
        if !matches {
            return None;
        }

        let mut request = self.in_flight.take()?;
        self.consecutive_timeouts = 0;

        if request.cancel_requested {
            return Some(ReplyMatch {
                finished: cancel(&mut request),
                rtt_sample: None,
            });
        }

        let attempts = request.attempts_made;
        let rtt = request
            .sent_at
            .map(|sent_at| now.saturating_duration_since(sent_at));
        // Replies to retransmitted requests are ambiguous and not sampled
        let rtt_sample = match rtt {
            Some(rtt) if attempts == 1 => Some((request.class(), rtt)),
            _ => None,
        };

        let finished = match outcome {
            ReplyOutcome::Accepted => finish(
                &mut request,
                RequestState::Acked,
                Ok(CommandSuccess { attempts, rtt }),
            ),
            ReplyOutcome::Rejected { reason } => {
                warn!(
                    agent = self.agent,
                    request = request.id,
                    reason = reason.as_str(),
                    "Command rejected by agent"
                );
                finish(
                    &mut request,
                    RequestState::Failed(FailureReason::Rejected),
                    Err(CommandFailure::new(FailureReason::Rejected, attempts)
                        .with_detail(reason.clone())),
                )
            }
        };

        Some(ReplyMatch {
            finished,
            rtt_sample,
        })
    }

    /// Request cancellation; it takes effect on the next tick or reply.
    ///
    /// Returns false if the request is not pending in this queue.
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        if let Some(request) = self.in_flight.as_mut().filter(|r| r.id == request_id) {
            request.cancel_requested = true;
            return true;
        }
        match self.queued.iter_mut().find(|r| r.id == request_id) {
            Some(request) => {
                request.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `AgentGone` and empty the queue
    pub fn evict_all(&mut self) -> Vec<FinishedRequest> {
        let mut finished = Vec::with_capacity(self.pending_len());
        let requests = self.in_flight.take().into_iter().chain(self.queued.drain(..));
        for mut request in requests {
            let attempts = request.attempts_made;
            finished.push(finish(
                &mut request,
                RequestState::Failed(FailureReason::AgentGone),
                Err(CommandFailure::new(FailureReason::AgentGone, attempts)),
            ));
        }
        finished
    }

    /// Current state of a pending request
    pub fn state_of(&self, request_id: RequestId) -> Option<RequestState> {
        self.in_flight
            .iter()
            .chain(self.queued.iter())
            .find(|r| r.id == request_id)
            .map(|r| r.state)
    }

    /// Number of requests currently awaiting a reply (0 or 1)
    pub fn awaiting_ack(&self) -> usize {
        usize::from(matches!(
            &self.in_flight,
            Some(request) if request.state == RequestState::AwaitingAck
        ))
    }

    fn apply_cancellations(&mut self) -> Vec<FinishedRequest> {
        let mut finished = Vec::new();

        if self.in_flight.as_ref().is_some_and(|r| r.cancel_requested) {
            if let Some(mut request) = self.in_flight.take() {
                finished.push(cancel(&mut request));
            }
        }

        if self.queued.iter().any(|r| r.cancel_requested) {
            let (mut cancelled, kept): (VecDeque<_>, VecDeque<_>) =
                self.queued.drain(..).partition(|r| r.cancel_requested);
            self.queued = kept;
            for request in cancelled.iter_mut() {
                finished.push(cancel(request));
            }
        }

        finished
    }

    /// Put a retried request at the head of its priority class
    fn requeue(&mut self, request: CommandRequest) {
        let position = match request.priority {
            Priority::Urgent => 0,
            Priority::Normal => self.first_normal_position(),
        };
        self.queued.insert(position, request);
    }

    fn first_normal_position(&self) -> usize {
        self.queued
            .iter()
            .position(|r| r.priority == Priority::Normal)
            .unwrap_or(self.queued.len())
    }
}

fn advance(request: &mut CommandRequest, to: RequestState) {
    match transition(request.state, to) {
        Ok(state) => request.state = state,
        Err(e) => error!(request = request.id, error = %e, "Illegal request state change"),
    }
}

fn cancel(request: &mut CommandRequest) -> FinishedRequest {
    let attempts = request.attempts_made;
    debug!(request = request.id, "Command cancelled");
    finish(
        request,
        RequestState::Cancelled,
        Err(CommandFailure::new(FailureReason::Cancelled, attempts)),
    )
}

fn finish(
    request: &mut CommandRequest,
    state: RequestState,
    outcome: CommandOutcome,
) -> FinishedRequest {
    advance(request, state);
    request.deadline = None;
    request.respond(outcome.clone());
    FinishedRequest {
        request_id: request.id,
        agent: request.agent,
        class: request.class(),
        state: request.state,
        outcome,
    }
}
