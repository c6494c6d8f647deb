//! fleetlink shared types
//!
//! This crate provides the types that cross the boundary of the dispatch
//! core: identifiers, the closed set of message kinds delivered by codecs,
//! outbound frames handed to transports, and the command request lifecycle.

pub mod message;
pub mod state_machine;

use std::fmt;
use std::sync::Arc;

pub use message::{
    BroadcastKind, BroadcastPayload, CommandPayload, Destination, ExchangeClass, InboundMessage,
    MessageKind, OutboundFrame, Reply, ReplyOutcome,
};
pub use state_machine::{FailureReason, RequestState};

/// Network-scoped agent identifier
pub type AgentId = u32;

/// Identifier of a request, unique within one dispatch core instance
pub type RequestId = u64;

/// Name of a logical network of agents
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(Arc<str>);

impl NetworkId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NetworkId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Token chosen by the codec layer that links a reply to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(pub u64);

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque capability flags reported by the codec for an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Urgency of a command request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}

/// Derived liveness classification of an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LivenessState {
    /// Never heard from
    #[default]
    Unknown,
    Online,
    /// Alive, but the flight controller reported itself powered down
    Sleeping,
    Offline,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LivenessState::Unknown => "unknown",
            LivenessState::Online => "online",
            LivenessState::Sleeping => "sleeping",
            LivenessState::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Default tuning values for networks and the dispatch core
pub mod defaults {
    /// Period of the router tick that drives command queues
    pub const TICK_INTERVAL_MS: u64 = 50;

    /// Period of the liveness sweep
    pub const LIVENESS_SWEEP_INTERVAL_MS: u64 = 1000;

    /// Silence after which an online agent is considered offline
    pub const ONLINE_TIMEOUT_MS: u64 = 5000;

    /// Lower bound of the adaptive command timeout
    pub const MIN_TIMEOUT_MS: u64 = 100;

    /// Upper bound of the adaptive command timeout
    pub const MAX_TIMEOUT_MS: u64 = 3000;

    /// Timeout used before any round-trip sample is available
    pub const INITIAL_TIMEOUT_MS: u64 = 1000;

    /// Attempts per command unless the caller asks otherwise
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Pending requests allowed per agent
    pub const PER_AGENT_QUEUE_DEPTH: usize = 16;

    /// How long terminal requests stay queryable
    pub const RESULT_GRACE_MS: u64 = 10_000;

    /// How long a broadcast may wait for rate limiter tokens
    pub const BROADCAST_GRACE_MS: u64 = 250;

    /// Period of the shared signing epoch synchronization
    pub const SIGNING_SYNC_INTERVAL_MS: u64 = 1000;

    /// Capacity of the per-network inbound channel
    pub const INBOUND_CAPACITY: usize = 1024;

    /// Capacity of the per-network control channel
    pub const COMMAND_CAPACITY: usize = 256;

    /// Capacity of the core event channel
    pub const EVENT_CAPACITY: usize = 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_id_display_and_eq() {
        let a = NetworkId::from("radio");
        let b = NetworkId::new(String::from("radio"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "radio");
        assert_eq!(a.as_str(), "radio");
    }

    #[test]
    fn test_capabilities_flags() {
        let caps = Capabilities(0b0101);
        assert!(caps.contains(Capabilities(0b0001)));
        assert!(!caps.contains(Capabilities(0b0010)));
        assert!(caps.contains(Capabilities::NONE));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
