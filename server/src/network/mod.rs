//! Per-network routing
//!
//! Each logical network gets one [`NetworkRouter`] driven by its own task.
//! The dispatch core reaches it only through the [`RouterHandle`] channels.

mod router;
mod task;

pub use router::NetworkRouter;
pub use task::{RouterCommand, RouterHandle};
