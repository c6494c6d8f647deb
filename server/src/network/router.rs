//! Network Router
//!
//! Owns everything about one logical network: its agents, their command
//! queues, the liveness tracker, round-trip estimates and the broadcast
//! rate limiter. A router is driven by exactly one task, so none of its
//! state is shared or locked.

use crate::command::{
    backoff, CommandQueue, CommandRequest, FinishedRequest, RequestHandle, RttEstimator,
};
use crate::config::NetworkConfig;
use crate::error::DispatchError;
use crate::events::{AgentSnapshot, CoreEvent, NetworkStats};
use crate::liveness::{LivenessTracker, LivenessTransition, SignalKind};
use crate::metrics::{counters, gauges, histograms};
use crate::ratelimit::TokenBucket;
use crate::transport::Transport;
use fleetlink_shared::{
    AgentId, BroadcastPayload, Capabilities, CommandPayload, Destination, ExchangeClass,
    InboundMessage, LivenessState, MessageKind, NetworkId, OutboundFrame, Priority, RequestId,
    RequestState,
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Router-side record of an agent
#[derive(Debug)]
struct Agent {
    capabilities: Capabilities,
    /// Created on the first command for the agent
    queue: Option<CommandQueue>,
}

/// Routes traffic of one network between the codec, the command queues and
/// the transport
pub struct NetworkRouter<T: Transport> {
    config: NetworkConfig,
    transport: T,
    agents: HashMap<AgentId, Agent>,
    liveness: LivenessTracker,
    estimator: RttEstimator<ExchangeClass>,
    limiter: Option<TokenBucket>,
    signing_epoch: u64,
    stats: NetworkStats,
    /// Pending request id to the agent whose queue holds it
    pending: HashMap<RequestId, AgentId>,
    /// Terminal states kept queryable until the result grace period ends
    results: HashMap<RequestId, RequestState>,
    result_expiry: VecDeque<(RequestId, Instant)>,
    events: broadcast::Sender<CoreEvent>,
}

impl<T: Transport> NetworkRouter<T> {
    pub fn new(
        config: NetworkConfig,
        transport: T,
        events: broadcast::Sender<CoreEvent>,
        now: Instant,
    ) -> Self {
        let limiter = config
            .broadcast_rate_limit
            .map(|limit| TokenBucket::new(limit, now));
        Self {
            liveness: LivenessTracker::new(config.online_timeout),
            estimator: RttEstimator::new(
                config.min_timeout,
                config.max_timeout,
                config.initial_timeout,
            ),
            stats: NetworkStats::new(config.id.clone()),
            config,
            transport,
            agents: HashMap::new(),
            limiter,
            signing_epoch: 0,
            pending: HashMap::new(),
            results: HashMap::new(),
            result_expiry: VecDeque::new(),
            events,
        }
    }

    pub fn id(&self) -> &NetworkId {
        &self.config.id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Route one inbound message, then dispatch whatever its reply unblocked
    pub async fn on_inbound(&mut self, message: InboundMessage, now: Instant) {
        if let Some(agent) = self.route_inbound(message, now) {
            self.pump_agent(agent, now).await;
        }
    }

    /// Update liveness and match replies for one inbound message.
    ///
    /// Returns the agent whose queue may now dispatch its next request.
    pub fn route_inbound(&mut self, message: InboundMessage, now: Instant) -> Option<AgentId> {
        if message.network_id != self.config.id {
            warn!(
                network = %self.config.id,
                from_network = %message.network_id,
                "Dropping message addressed to another network"
            );
            counters::inbound_dropped_total(&self.config.id, "wrong_network");
            return None;
        }

        let agent = message.agent_id;
        if !self.agents.contains_key(&agent) && !self.admit(agent) {
            return None;
        }

        self.stats.inbound.record(message.kind);
        counters::inbound_total(&self.config.id, message.kind.as_str());

        if let Some(capabilities) = message.capabilities {
            if let Some(record) = self.agents.get_mut(&agent) {
                record.capabilities = capabilities;
            }
        }

        let signal = match message.kind {
            MessageKind::LowPowerHeartbeat => SignalKind::PoweredDown,
            _ => SignalKind::Alive,
        };
        if let Some(transition) = self.liveness.observe(agent, now, signal) {
            self.publish_transition(transition);
        }

        let reply = message.reply?;
        let matched = self
            .agents
            .get_mut(&agent)
            .and_then(|record| record.queue.as_mut())
            .and_then(|queue| queue.on_reply(reply.key, &reply.outcome, now));

        match matched {
            Some(matched) => {
                if let Some((class, rtt)) = matched.rtt_sample {
                    self.estimator.on_sample(class, rtt);
                    histograms::rtt_seconds(&self.config.id, class.as_str(), rtt);
                }
                self.finish(matched.finished, now);
                Some(agent)
            }
            None => {
                self.stats.unmatched_replies += 1;
                debug!(
                    network = %self.config.id,
                    agent,
                    key = %reply.key,
                    "Reply matched no pending command"
                );
                None
            }
        }
    }

    /// Register a previously unseen agent unless the network is full
    fn admit(&mut self, agent: AgentId) -> bool {
        if let Some(max) = self.config.max_agent_count {
            if self.agents.len() >= max {
                self.stats.dropped_agent_cap += 1;
                counters::inbound_dropped_total(&self.config.id, "agent_cap");
                debug!(
                    network = %self.config.id,
                    agent,
                    max,
                    "Agent cap reached, dropping message"
                );
                return false;
            }
        }

        self.agents.insert(
            agent,
            Agent {
                capabilities: Capabilities::NONE,
                queue: None,
            },
        );
        info!(network = %self.config.id, agent, "New agent registered");
        let _ = self.events.send(CoreEvent::AgentRegistered {
            network: self.config.id.clone(),
            agent,
        });
        true
    }

    /// Queue a unicast command for a known agent and try to dispatch it.
    pub async fn submit(
        &mut self,
        request_id: RequestId,
        agent: AgentId,
        payload: CommandPayload,
        priority: Priority,
        max_attempts: u32,
        now: Instant,
    ) -> Result<RequestHandle, DispatchError> {
        let handle = self.enqueue(request_id, agent, payload, priority, max_attempts)?;
        self.pump_agent(agent, now).await;
        Ok(handle)
    }

    /// Queue a command without dispatching it
    pub fn enqueue(
        &mut self,
        request_id: RequestId,
        agent: AgentId,
        payload: CommandPayload,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<RequestHandle, DispatchError> {
        let depth = self.config.per_agent_queue_depth;
        let record = self
            .agents
            .get_mut(&agent)
            .ok_or_else(|| DispatchError::UnknownAgent {
                network: self.config.id.clone(),
                agent,
            })?;

        let max_attempts = if max_attempts == 0 {
            self.config.default_max_attempts
        } else {
            max_attempts
        };
        let (request, handle) = CommandRequest::new(
            request_id,
            self.config.id.clone(),
            agent,
            payload,
            priority,
            max_attempts,
        );

        record
            .queue
            .get_or_insert_with(|| CommandQueue::new(agent, depth))
            .submit(request)
            .map_err(|bp| DispatchError::QueueFull {
                network: self.config.id.clone(),
                agent,
                depth: bp.depth,
            })?;

        self.pending.insert(request_id, agent);
        debug!(
            network = %self.config.id,
            agent,
            request = request_id,
            ?priority,
            "Command queued"
        );
        Ok(handle)
    }

    /// Expire, cancel and dispatch requests of one agent.
    ///
    /// Dispatch continues while requests complete on transmission; it stops
    /// once a request awaits its reply, a send fails, or bulk traffic runs
    /// out of rate limiter tokens.
    pub async fn pump_agent(&mut self, agent: AgentId, now: Instant) {
        let mut finished = Vec::new();
        let mut retries = 0u64;

        {
            let Some(queue) = self
                .agents
                .get_mut(&agent)
                .and_then(|record| record.queue.as_mut())
            else {
                return;
            };

            finished.extend(queue.on_tick(now));

            while let Some(class) = queue.next_class() {
                if class.is_bulk() {
                    if let Some(limiter) = self.limiter.as_mut() {
                        if !limiter.acquire(1, now) {
                            break;
                        }
                    }
                }

                let Some(dispatch) = queue.dispatch_next() else {
                    break;
                };
                if dispatch.attempt > 1 {
                    retries += 1;
                }

                let timeout = backoff(
                    self.estimator.timeout_for(&dispatch.class),
                    queue.consecutive_timeouts(),
                    self.config.max_timeout,
                );
                let frame = OutboundFrame {
                    network_id: self.config.id.clone(),
                    destination: Destination::Unicast(agent),
                    body: dispatch.body,
                    correlation_key: dispatch.correlation_key,
                    signing_epoch: self.signing_epoch,
                };

                match self.transport.send(frame).await {
                    Ok(()) => {
                        self.stats.unicast_sent += 1;
                        finished.extend(queue.on_transmitted(now, timeout));
                    }
                    Err(e) => {
                        self.stats.send_failures += 1;
                        warn!(
                            network = %self.config.id,
                            agent,
                            request = dispatch.request_id,
                            error = %e,
                            "Transport refused command frame"
                        );
                        finished.extend(queue.on_send_failed(&e.to_string()));
                        break;
                    }
                }

                if queue.awaiting_ack() > 0 {
                    break;
                }
            }
        }

        if retries > 0 {
            self.stats.retries += retries;
            for _ in 0..retries {
                counters::retries_total(&self.config.id);
            }
        }
        for request in finished {
            self.finish(request, now);
        }
    }

    /// Drive every agent's queue once
    pub async fn pump_all(&mut self, now: Instant) {
        let agents: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|(_, record)| record.queue.as_ref().is_some_and(|q| !q.is_empty()))
            .map(|(&agent, _)| agent)
            .collect();

        for agent in agents {
            self.pump_agent(agent, now).await;
        }

        self.expire_results(now);
        gauges::queue_depth(&self.config.id, self.queue_depth());
    }

    /// Move silent agents offline and publish the transitions
    pub fn sweep(&mut self, now: Instant) -> Vec<LivenessTransition> {
        let transitions = self.liveness.sweep(now);
        for transition in &transitions {
            self.publish_transition(*transition);
        }
        transitions
    }

    /// Liveness sweep plus one pass over every command queue
    pub async fn tick(&mut self, now: Instant) {
        self.sweep(now);
        self.pump_all(now).await;
    }

    /// Send a frame to every agent of the network.
    ///
    /// Waits for rate limiter tokens until `deadline` at most.
    pub async fn broadcast(
        &mut self,
        payload: BroadcastPayload,
        deadline: Instant,
    ) -> Result<(), DispatchError> {
        if let Some(limiter) = self.limiter.as_mut() {
            if !limiter.acquire_blocking(1, deadline).await {
                self.stats.broadcasts_rate_limited += 1;
                debug!(
                    network = %self.config.id,
                    kind = payload.kind.as_str(),
                    "Broadcast rate limited"
                );
                return Err(DispatchError::RateLimited(self.config.id.clone()));
            }
        }

        let frame = OutboundFrame {
            network_id: self.config.id.clone(),
            destination: Destination::Broadcast,
            body: payload.body,
            correlation_key: None,
            signing_epoch: self.signing_epoch,
        };
        self.transport
            .send(frame)
            .await
            .map_err(|source| DispatchError::Transport {
                network: self.config.id.clone(),
                source,
            })?;

        *self.stats.broadcasts.entry(payload.kind).or_insert(0) += 1;
        counters::broadcasts_total(&self.config.id, payload.kind.as_str());
        Ok(())
    }

    /// Broadcast correction-stream data if this network takes part.
    ///
    /// Returns whether the payload was sent. With `skip_if_idle`, networks
    /// without any online agent are skipped.
    pub async fn correction(
        &mut self,
        payload: BroadcastPayload,
        skip_if_idle: bool,
        deadline: Instant,
    ) -> Result<bool, DispatchError> {
        if !self.config.uses_correction_stream {
            return Ok(false);
        }
        if skip_if_idle && !self.liveness.any_online() {
            return Ok(false);
        }
        self.broadcast(payload, deadline).await?;
        Ok(true)
    }

    /// Request cancellation of a pending command; applied on the next pump
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        let Some(&agent) = self.pending.get(&request_id) else {
            return false;
        };
        self.agents
            .get_mut(&agent)
            .and_then(|record| record.queue.as_mut())
            .is_some_and(|queue| queue.cancel(request_id))
    }

    /// Forget an agent, failing its pending commands with `AgentGone`
    pub fn deregister(&mut self, agent: AgentId, now: Instant) -> Result<(), DispatchError> {
        let record = self
            .agents
            .remove(&agent)
            .ok_or_else(|| DispatchError::UnknownAgent {
                network: self.config.id.clone(),
                agent,
            })?;
        self.evict(agent, record, now);
        Ok(())
    }

    /// Evict every agent; used when the network is torn down
    pub fn shutdown(&mut self, now: Instant) {
        let agents: Vec<(AgentId, Agent)> = self.agents.drain().collect();
        for (agent, record) in agents {
            self.evict(agent, record, now);
        }
        gauges::queue_depth(&self.config.id, 0);
    }

    fn evict(&mut self, agent: AgentId, record: Agent, now: Instant) {
        if let Some(mut queue) = record.queue {
            for request in queue.evict_all() {
                self.finish(request, now);
            }
        }
        self.liveness.remove(agent);
        info!(network = %self.config.id, agent, "Agent evicted");
        let _ = self.events.send(CoreEvent::AgentEvicted {
            network: self.config.id.clone(),
            agent,
        });
    }

    /// Adopt a newer signing epoch; older values are ignored
    pub fn set_signing_epoch(&mut self, epoch: u64) {
        if epoch > self.signing_epoch {
            self.signing_epoch = epoch;
        }
    }

    pub fn signing_epoch(&self) -> u64 {
        self.signing_epoch
    }

    pub fn state_of(&self, agent: AgentId) -> LivenessState {
        self.liveness.state_of(agent)
    }

    /// State of a pending request, or of a finished one within the grace period
    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        if let Some(agent) = self.pending.get(&request_id) {
            return self
                .agents
                .get(agent)
                .and_then(|record| record.queue.as_ref())
                .and_then(|queue| queue.state_of(request_id));
        }
        self.results.get(&request_id).copied()
    }

    /// Pending requests across all agents
    pub fn queue_depth(&self) -> usize {
        self.agents
            .values()
            .filter_map(|record| record.queue.as_ref())
            .map(CommandQueue::pending_len)
            .sum()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn has_online_agents(&self) -> bool {
        self.liveness.any_online()
    }

    /// Read-only views of all agents, ordered by id
    pub fn agents(&self, now: Instant) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<AgentSnapshot> = self
            .agents
            .iter()
            .map(|(&agent, record)| AgentSnapshot {
                agent,
                liveness: self.liveness.state_of(agent),
                last_seen_age: self
                    .liveness
                    .last_seen(agent)
                    .map(|seen| now.saturating_duration_since(seen)),
                capabilities: record.capabilities,
                queue_depth: record.queue.as_ref().map_or(0, CommandQueue::pending_len),
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.agent);
        snapshots
    }

    /// Counters of this network with the current gauges filled in
    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats.clone();
        stats.agents = self.agents.len();
        stats.agents_online = self.liveness.online_count();
        stats.queue_depth = self.queue_depth();
        stats.signing_epoch = self.signing_epoch;
        stats.rate_limiter = self.limiter.as_ref().map(TokenBucket::stats);
        stats
    }

    fn publish_transition(&self, transition: LivenessTransition) {
        gauges::agents_online(&self.config.id, self.liveness.online_count());
        let _ = self.events.send(CoreEvent::Liveness {
            network: self.config.id.clone(),
            agent: transition.agent,
            from: transition.from,
            to: transition.to,
        });
    }

    fn finish(&mut self, request: FinishedRequest, now: Instant) {
        self.pending.remove(&request.request_id);
        self.stats.record_finished(request.state);

        let outcome_label = match request.state {
            RequestState::Failed(reason) => reason.as_str(),
            RequestState::Cancelled => "cancelled",
            _ => "acked",
        };
        counters::commands_total(&self.config.id, outcome_label);

        self.results.insert(request.request_id, request.state);
        self.result_expiry
            .push_back((request.request_id, now + self.config.result_grace));

        let _ = self.events.send(CoreEvent::CommandFinished {
            network: self.config.id.clone(),
            agent: request.agent,
            request: request.request_id,
            state: request.state,
            outcome: request.outcome,
        });
    }

    fn expire_results(&mut self, now: Instant) {
        while let Some(&(request_id, expires_at)) = self.result_expiry.front() {
            if expires_at > now {
                break;
            }
            self.result_expiry.pop_front();
            self.results.remove(&request_id);
        }
    }
}
