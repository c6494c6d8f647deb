//! Simulated links between the dispatch core and virtual agents
//!
//! This module handles:
//! - Delivering outbound frames to virtual agents with latency and loss
//! - Periodic heartbeats from every agent on the link
//! - Accept/reject replies carrying the command's correlation key

mod link;

pub use link::{LinkConfig, VirtualLink};
