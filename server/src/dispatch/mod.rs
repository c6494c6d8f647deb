//! Top-level coordination across networks

mod dispatcher;
mod signing;

pub use dispatcher::DispatchCore;
pub use signing::{epoch_at, SigningClock};
