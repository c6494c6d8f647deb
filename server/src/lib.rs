//! fleetlink server
//!
//! Agent communication and command-dispatch core. It multiplexes several
//! logical networks of remote agents, tracks their liveness, keeps a bounded
//! retrying command queue per agent, and routes broadcast traffic through
//! per-network rate limiters.
//!
//! Encoding and the physical links are not handled here: codecs push
//! [`InboundMessage`]s into the sender returned by
//! [`DispatchCore::add_network`], and outbound frames leave through a
//! [`Transport`].
//!
//! [`InboundMessage`]: fleetlink_shared::InboundMessage

pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod liveness;
pub mod metrics;
pub mod network;
pub mod ratelimit;
pub mod transport;

pub use command::{CommandFailure, CommandOutcome, CommandSuccess, RequestHandle};
pub use config::{CoreConfig, NetworkConfig, RateLimit};
pub use dispatch::DispatchCore;
pub use error::{ConfigError, DispatchError, TransportError};
pub use events::{AgentSnapshot, CoreEvent, NetworkStats};
pub use transport::{ChannelTransport, Transport};
