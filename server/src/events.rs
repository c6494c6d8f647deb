//! Observable state: core events, per-network counters and agent snapshots

use crate::command::CommandOutcome;
use crate::ratelimit::TokenBucketStats;
use fleetlink_shared::{
    AgentId, BroadcastKind, Capabilities, LivenessState, MessageKind, NetworkId, RequestId,
    RequestState,
};
use std::collections::HashMap;
use std::time::Duration;

/// Event published by routers on the core's broadcast channel
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// An agent changed liveness state
    Liveness {
        network: NetworkId,
        agent: AgentId,
        from: LivenessState,
        to: LivenessState,
    },
    /// A command reached a terminal state
    CommandFinished {
        network: NetworkId,
        agent: AgentId,
        request: RequestId,
        state: RequestState,
        outcome: CommandOutcome,
    },
    /// First message from a previously unseen agent
    AgentRegistered { network: NetworkId, agent: AgentId },
    /// Agent removed by deregistration or network teardown
    AgentEvicted { network: NetworkId, agent: AgentId },
}

/// Inbound messages counted by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundCounts {
    pub heartbeat: u64,
    pub low_power_heartbeat: u64,
    pub reply: u64,
    pub telemetry: u64,
}

impl InboundCounts {
    pub fn record(&mut self, kind: MessageKind) {
        match kind {
            MessageKind::Heartbeat => self.heartbeat += 1,
            MessageKind::LowPowerHeartbeat => self.low_power_heartbeat += 1,
            MessageKind::Reply => self.reply += 1,
            MessageKind::Telemetry => self.telemetry += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.heartbeat + self.low_power_heartbeat + self.reply + self.telemetry
    }
}

/// Traffic and queue counters of one network
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStats {
    pub network: NetworkId,
    pub agents: usize,
    pub agents_online: usize,
    pub inbound: InboundCounts,
    /// Replies that matched no request awaiting an answer
    pub unmatched_replies: u64,
    /// Messages dropped because the agent cap was reached
    pub dropped_agent_cap: u64,
    /// Unicast frames accepted by the transport
    pub unicast_sent: u64,
    pub send_failures: u64,
    pub retries: u64,
    pub acked: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Broadcast frames sent, by kind
    pub broadcasts: HashMap<BroadcastKind, u64>,
    /// Broadcasts refused by the rate limiter
    pub broadcasts_rate_limited: u64,
    /// Pending requests across all agents
    pub queue_depth: usize,
    pub signing_epoch: u64,
    /// Token bucket counters, `None` for unthrottled networks
    pub rate_limiter: Option<TokenBucketStats>,
}

impl NetworkStats {
    pub fn new(network: NetworkId) -> Self {
        Self {
            network,
            agents: 0,
            agents_online: 0,
            inbound: InboundCounts::default(),
            unmatched_replies: 0,
            dropped_agent_cap: 0,
            unicast_sent: 0,
            send_failures: 0,
            retries: 0,
            acked: 0,
            failed: 0,
            cancelled: 0,
            broadcasts: HashMap::new(),
            broadcasts_rate_limited: 0,
            queue_depth: 0,
            signing_epoch: 0,
            rate_limiter: None,
        }
    }

    pub fn broadcasts_of(&self, kind: BroadcastKind) -> u64 {
        self.broadcasts.get(&kind).copied().unwrap_or(0)
    }

    pub(crate) fn record_finished(&mut self, state: RequestState) {
        match state {
            RequestState::Acked => self.acked += 1,
            RequestState::Cancelled => self.cancelled += 1,
            RequestState::Failed(_) => self.failed += 1,
            _ => {}
        }
    }
}

/// Read-only view of one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub agent: AgentId,
    pub liveness: LivenessState,
    /// Time since the agent was last heard from
    pub last_seen_age: Option<Duration>,
    pub capabilities: Capabilities,
    /// Pending requests for the agent
    pub queue_depth: usize,
}
