//! Command execution on virtual agents
//!
//! This module handles:
//! - Decoding commands addressed to a simulated agent
//! - Validating them against the agent's flight state
//! - Producing the accept/reject outcome sent back as a reply

mod executor;

pub use executor::{AgentState, CommandExecutor, CommandResult};
