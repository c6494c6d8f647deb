use fleetlink_shared::{AgentId, NetworkId};
use thiserror::Error;

/// Errors surfaced synchronously to callers of the dispatch core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No network with this id is attached to the core.
    #[error("unknown network: {0}")]
    UnknownNetwork(NetworkId),
    /// The agent has never been heard from on this network, or was evicted.
    #[error("unknown agent {agent} on network {network}")]
    UnknownAgent { network: NetworkId, agent: AgentId },
    /// The agent's command queue is at capacity; retry later or drop.
    #[error("command queue full for agent {agent} on network {network} (depth {depth})")]
    QueueFull {
        network: NetworkId,
        agent: AgentId,
        depth: usize,
    },
    /// Broadcast tokens did not become available before the grace deadline.
    #[error("broadcast rate limit exceeded on network {0}")]
    RateLimited(NetworkId),
    /// The transport refused a broadcast frame.
    #[error("transport error on network {network}: {source}")]
    Transport {
        network: NetworkId,
        #[source]
        source: TransportError,
    },
    /// The router task of the network is no longer running.
    #[error("network {0} is closed")]
    NetworkClosed(NetworkId),
    /// A network with this id is already attached.
    #[error("network {0} already exists")]
    DuplicateNetwork(NetworkId),
    /// The network configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DispatchError {
    /// Check if this is the backpressure error of a full queue
    pub fn is_backpressure(&self) -> bool {
        matches!(self, DispatchError::QueueFull { .. })
    }
}

/// Synchronous send failure reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is down or closed.
    #[error("link closed")]
    Closed,
    /// The link refused the frame.
    #[error("send failed: {0}")]
    Send(String),
}

/// Invalid network or core configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("network id must not be empty")]
    EmptyNetworkId,
    #[error("duplicate network id: {0}")]
    DuplicateNetworkId(NetworkId),
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },
    #[error("timeouts must satisfy min_timeout <= initial_timeout <= max_timeout")]
    TimeoutOrder,
    #[error("broadcast rate limit must have a positive rate and a burst of at least 1")]
    InvalidRateLimit,
}
