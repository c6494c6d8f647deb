//! Command dispatch and timeout tracking
//!
//! This module handles:
//! - Queuing commands per agent with bounded depth and priorities
//! - Adaptive reply timeouts with exponential backoff
//! - Retry logic for timed-out and refused attempts
//! - Delivering terminal outcomes to the submitter

mod queue;
mod request;
mod timeout;

pub use queue::{Backpressure, CommandQueue, Dispatch, FinishedRequest, ReplyMatch};
pub use request::{CommandFailure, CommandOutcome, CommandRequest, CommandSuccess, RequestHandle};
pub use timeout::{backoff, RttEstimator, RttState};
