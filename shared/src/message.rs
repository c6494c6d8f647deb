//! Messages exchanged between the codec layer, the core and transports
//!
//! The core never looks inside payloads. It only branches on the message
//! kind, the sender, and the optional reply correlation.

use bytes::Bytes;

use crate::{AgentId, Capabilities, CorrelationKey, NetworkId};

/// Closed set of inbound message kinds a codec can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Periodic "I am alive" signal
    Heartbeat,
    /// Heartbeat sent while the flight controller is powered down
    LowPowerHeartbeat,
    /// Response to an earlier command
    Reply,
    /// Unsolicited telemetry (position, battery, status text...)
    Telemetry,
}

impl MessageKind {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::LowPowerHeartbeat => "low_power_heartbeat",
            MessageKind::Reply => "reply",
            MessageKind::Telemetry => "telemetry",
        }
    }
}

/// How an agent answered a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Accepted,
    Rejected { reason: String },
}

/// Reply portion of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub key: CorrelationKey,
    pub outcome: ReplyOutcome,
}

/// One decoded inbound unit delivered by the codec layer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub network_id: NetworkId,
    pub agent_id: AgentId,
    pub kind: MessageKind,
    pub payload: Bytes,
    pub reply: Option<Reply>,
    /// Capability flags, when the codec learned them from this message
    pub capabilities: Option<Capabilities>,
}

impl InboundMessage {
    pub fn new(network_id: NetworkId, agent_id: AgentId, kind: MessageKind) -> Self {
        Self {
            network_id,
            agent_id,
            kind,
            payload: Bytes::new(),
            reply: None,
            capabilities: None,
        }
    }

    /// Create a heartbeat from the given agent
    pub fn heartbeat(network_id: NetworkId, agent_id: AgentId) -> Self {
        Self::new(network_id, agent_id, MessageKind::Heartbeat)
    }

    /// Create a low-power heartbeat from the given agent
    pub fn low_power_heartbeat(network_id: NetworkId, agent_id: AgentId) -> Self {
        Self::new(network_id, agent_id, MessageKind::LowPowerHeartbeat)
    }

    /// Create an accepting reply for the given correlation key
    pub fn accepted(network_id: NetworkId, agent_id: AgentId, key: CorrelationKey) -> Self {
        Self {
            reply: Some(Reply {
                key,
                outcome: ReplyOutcome::Accepted,
            }),
            ..Self::new(network_id, agent_id, MessageKind::Reply)
        }
    }

    /// Create a rejecting reply for the given correlation key
    pub fn rejected(
        network_id: NetworkId,
        agent_id: AgentId,
        key: CorrelationKey,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            reply: Some(Reply {
                key,
                outcome: ReplyOutcome::Rejected {
                    reason: reason.into(),
                },
            }),
            ..Self::new(network_id, agent_id, MessageKind::Reply)
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

/// Category of request/reply exchange; each keeps its own round-trip estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeClass {
    /// Small command with a short acknowledgement
    #[default]
    Command,
    /// Parameter read or write
    Parameter,
    /// Chunk of a larger upload; counts as bulk traffic
    FileTransfer,
}

impl ExchangeClass {
    pub fn is_bulk(self) -> bool {
        matches!(self, ExchangeClass::FileTransfer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeClass::Command => "command",
            ExchangeClass::Parameter => "parameter",
            ExchangeClass::FileTransfer => "file_transfer",
        }
    }
}

/// Encoded command handed to the core for unicast delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPayload {
    pub class: ExchangeClass,
    pub body: Bytes,
    /// `None` for fire-and-forget commands
    pub correlation_key: Option<CorrelationKey>,
}

impl CommandPayload {
    /// Command that is complete once an agent reply with `key` arrives
    pub fn expecting_reply(body: impl Into<Bytes>, key: CorrelationKey) -> Self {
        Self {
            class: ExchangeClass::Command,
            body: body.into(),
            correlation_key: Some(key),
        }
    }

    /// Command that is complete as soon as the transport accepted it
    pub fn fire_and_forget(body: impl Into<Bytes>) -> Self {
        Self {
            class: ExchangeClass::Command,
            body: body.into(),
            correlation_key: None,
        }
    }

    pub fn with_class(mut self, class: ExchangeClass) -> Self {
        self.class = class;
        self
    }

    pub fn expects_reply(&self) -> bool {
        self.correlation_key.is_some()
    }
}

/// Type of broadcast traffic, used for per-type rate accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastKind {
    Heartbeat,
    Correction,
    Command,
    Signing,
    Other,
}

impl BroadcastKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastKind::Heartbeat => "heartbeat",
            BroadcastKind::Correction => "correction",
            BroadcastKind::Command => "command",
            BroadcastKind::Signing => "signing",
            BroadcastKind::Other => "other",
        }
    }
}

/// Encoded payload sent to every agent of a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPayload {
    pub kind: BroadcastKind,
    pub body: Bytes,
}

impl BroadcastPayload {
    pub fn new(kind: BroadcastKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn correction(body: impl Into<Bytes>) -> Self {
        Self::new(BroadcastKind::Correction, body)
    }
}

/// Addressing of an outbound frame within its network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Unicast(AgentId),
    Broadcast,
}

/// Unit of outbound traffic handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub network_id: NetworkId,
    pub destination: Destination,
    pub body: Bytes,
    /// Correlation key of the command carried by a unicast frame
    pub correlation_key: Option<CorrelationKey>,
    /// Signing epoch the codec must sign this frame with
    pub signing_epoch: u64,
}
