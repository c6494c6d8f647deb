//! Transport trait abstraction for pluggable link backends

use crate::error::TransportError;
use async_trait::async_trait;
use fleetlink_shared::OutboundFrame;
use tokio::sync::mpsc;

/// Outbound side of a network's link.
///
/// Encoding and the physical medium live behind this trait. A send error is
/// reported synchronously and counted as a failed attempt.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Hand one frame to the link
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &str;
}

/// Transport that forwards frames into an in-memory channel.
///
/// Used by tests and by the virtual fleet; fails with `Closed` once the
/// receiving end is dropped.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    name: String,
    tx: mpsc::Sender<OutboundFrame>,
}

impl ChannelTransport {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Create a transport together with the receiver of its frames
    pub fn pair(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(name, tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.tx
            .try_send(frame)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Send(format!("{} link is saturated", self.name))
                }
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
