//! Configuration of networks and of the dispatch core

use crate::error::ConfigError;
use fleetlink_shared::{defaults, NetworkId};
use std::collections::HashSet;
use std::time::Duration;

/// Token bucket parameters for outbound broadcast and bulk traffic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Tokens added per second
    pub per_second: f64,
    /// Bucket size; the largest burst that can go out at once
    pub burst: u32,
}

impl RateLimit {
    pub fn new(per_second: f64, burst: u32) -> Self {
        Self { per_second, burst }
    }
}

/// Configuration for one network of agents
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Unique network id
    pub id: NetworkId,
    /// Maximum number of agents tracked on this network
    pub max_agent_count: Option<usize>,
    /// Silence after which an online agent becomes offline
    pub online_timeout: Duration,
    /// Throttle for broadcasts and bulk unicast; `None` means unlimited
    pub broadcast_rate_limit: Option<RateLimit>,
    /// Pending requests allowed per agent
    pub per_agent_queue_depth: usize,
    /// Lower bound of the adaptive command timeout
    pub min_timeout: Duration,
    /// Upper bound of the adaptive command timeout, also the backoff cap
    pub max_timeout: Duration,
    /// Timeout used before any round-trip sample exists
    pub initial_timeout: Duration,
    /// Attempts per command when the caller passes zero
    pub default_max_attempts: u32,
    /// Whether correction-stream data is fanned out to this network
    pub uses_correction_stream: bool,
    /// How long terminal requests stay queryable
    pub result_grace: Duration,
    /// How long a broadcast may wait for rate limiter tokens
    pub broadcast_grace: Duration,
    /// Period of the router tick that drives command queues
    pub tick_interval: Duration,
    /// Period of the liveness sweep
    pub liveness_sweep_interval: Duration,
    /// Capacity of the inbound channel fed by the codec
    pub inbound_capacity: usize,
    /// Capacity of the control channel fed by the dispatch core
    pub command_capacity: usize,
}

impl NetworkConfig {
    /// Create a configuration with default tuning for the given network id
    pub fn new(id: impl Into<NetworkId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Validates the configuration values are within acceptable bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.as_str().is_empty() {
            return Err(ConfigError::EmptyNetworkId);
        }
        if self.max_agent_count == Some(0) {
            return Err(ConfigError::Zero {
                field: "max_agent_count",
            });
        }
        if self.per_agent_queue_depth == 0 {
            return Err(ConfigError::Zero {
                field: "per_agent_queue_depth",
            });
        }
        if self.online_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "online_timeout",
            });
        }
        if self.min_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "min_timeout",
            });
        }
        if self.min_timeout > self.initial_timeout || self.initial_timeout > self.max_timeout {
            return Err(ConfigError::TimeoutOrder);
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "default_max_attempts",
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "tick_interval",
            });
        }
        if self.liveness_sweep_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "liveness_sweep_interval",
            });
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "inbound_capacity",
            });
        }
        if self.command_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "command_capacity",
            });
        }
        if let Some(limit) = self.broadcast_rate_limit {
            if !(limit.per_second > 0.0 && limit.per_second.is_finite()) || limit.burst == 0 {
                return Err(ConfigError::InvalidRateLimit);
            }
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: NetworkId::from("default"),
            max_agent_count: None,
            online_timeout: Duration::from_millis(defaults::ONLINE_TIMEOUT_MS),
            broadcast_rate_limit: None,
            per_agent_queue_depth: defaults::PER_AGENT_QUEUE_DEPTH,
            min_timeout: Duration::from_millis(defaults::MIN_TIMEOUT_MS),
            max_timeout: Duration::from_millis(defaults::MAX_TIMEOUT_MS),
            initial_timeout: Duration::from_millis(defaults::INITIAL_TIMEOUT_MS),
            default_max_attempts: defaults::MAX_ATTEMPTS,
            uses_correction_stream: true,
            result_grace: Duration::from_millis(defaults::RESULT_GRACE_MS),
            broadcast_grace: Duration::from_millis(defaults::BROADCAST_GRACE_MS),
            tick_interval: Duration::from_millis(defaults::TICK_INTERVAL_MS),
            liveness_sweep_interval: Duration::from_millis(defaults::LIVENESS_SWEEP_INTERVAL_MS),
            inbound_capacity: defaults::INBOUND_CAPACITY,
            command_capacity: defaults::COMMAND_CAPACITY,
        }
    }
}

/// Configuration of the dispatch core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub networks: Vec<NetworkConfig>,
    /// Period of the shared signing epoch synchronization
    pub signing_sync_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl CoreConfig {
    /// Validates every network and the core-level settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_sync_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "signing_sync_interval",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "event_capacity",
            });
        }

        let mut seen = HashSet::new();
        for network in &self.networks {
            network.validate()?;
            if !seen.insert(network.id.clone()) {
                return Err(ConfigError::DuplicateNetworkId(network.id.clone()));
            }
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            signing_sync_interval: Duration::from_millis(defaults::SIGNING_SYNC_INTERVAL_MS),
            event_capacity: defaults::EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_config_is_valid() {
        assert!(NetworkConfig::new("n1").validate().is_ok());
    }

    #[test]
    fn empty_id_is_rejected() {
        let config = NetworkConfig::new("");
        assert_eq!(config.validate(), Err(ConfigError::EmptyNetworkId));
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        let mut config = NetworkConfig::new("n1");
        config.per_agent_queue_depth = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "per_agent_queue_depth"
            })
        );
    }

    #[test]
    fn timeouts_out_of_order_are_rejected() {
        let mut config = NetworkConfig::new("n1");
        config.min_timeout = Duration::from_secs(5);
        assert_eq!(config.validate(), Err(ConfigError::TimeoutOrder));

        let mut config = NetworkConfig::new("n1");
        config.initial_timeout = config.max_timeout + Duration::from_millis(1);
        assert_eq!(config.validate(), Err(ConfigError::TimeoutOrder));
    }

    #[test]
    fn invalid_rate_limit_is_rejected() {
        let mut config = NetworkConfig::new("n1");
        config.broadcast_rate_limit = Some(RateLimit::new(0.0, 10));
        assert_eq!(config.validate(), Err(ConfigError::InvalidRateLimit));

        config.broadcast_rate_limit = Some(RateLimit::new(100.0, 0));
        assert_eq!(config.validate(), Err(ConfigError::InvalidRateLimit));

        config.broadcast_rate_limit = Some(RateLimit::new(100.0, 1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_agent_cap_is_rejected() {
        let mut config = NetworkConfig::new("n1");
        config.max_agent_count = Some(0);
        assert!(config.validate().is_err());
        config.max_agent_count = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_networks_are_rejected() {
        let config = CoreConfig {
            networks: vec![NetworkConfig::new("radio"), NetworkConfig::new("radio")],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateNetworkId(NetworkId::from("radio")))
        );
    }

    #[test]
    fn core_config_with_distinct_networks_is_valid() {
        let config = CoreConfig {
            networks: vec![NetworkConfig::new("radio"), NetworkConfig::new("wifi")],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
