//! Virtual link: a lossy, delayed channel to a group of simulated agents

use crate::command::{CommandExecutor, CommandResult};
use fleetlink_shared::{
    AgentId, Capabilities, Destination, InboundMessage, NetworkId, OutboundFrame,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration of one simulated link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Agents reachable over this link
    pub agents: Vec<AgentId>,
    /// Capability flags every agent reports with its heartbeat
    pub capabilities: Capabilities,
    pub heartbeat_interval: Duration,
    /// One-way delay applied to replies
    pub latency: Duration,
    /// Probability in [0, 1] that a frame or reply is lost
    pub packet_loss: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            agents: vec![1],
            capabilities: Capabilities::NONE,
            heartbeat_interval: Duration::from_secs(1),
            latency: Duration::from_millis(20),
            packet_loss: 0.0,
        }
    }
}

/// Agents on the far side of a transport
pub struct VirtualLink {
    network: NetworkId,
    config: LinkConfig,
    agents: BTreeMap<AgentId, CommandExecutor>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl VirtualLink {
    pub fn new(
        network: NetworkId,
        config: LinkConfig,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Self {
        let agents = config
            .agents
            .iter()
            .map(|&id| (id, CommandExecutor::new(id)))
            .collect();
        Self {
            network,
            config,
            agents,
            inbound,
        }
    }

    /// Serve frames and emit heartbeats until either channel closes
    pub async fn run(mut self, mut frames: mpsc::Receiver<OutboundFrame>) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            network = %self.network,
            agents = self.agents.len(),
            "Virtual link up"
        );
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if self.send_heartbeats().await.is_err() {
                        break;
                    }
                }
            }
        }
        info!(network = %self.network, "Virtual link down");
    }

    fn lost(&self) -> bool {
        self.config.packet_loss > 0.0
            && rand::thread_rng().gen_bool(self.config.packet_loss.clamp(0.0, 1.0))
    }

    fn on_frame(&mut self, frame: OutboundFrame) {
        if self.lost() {
            debug!(network = %self.network, destination = ?frame.destination, "Frame lost");
            return;
        }

        let agent = match frame.destination {
            Destination::Broadcast => {
                debug!(
                    network = %self.network,
                    bytes = frame.body.len(),
                    epoch = frame.signing_epoch,
                    "Broadcast delivered"
                );
                return;
            }
            Destination::Unicast(agent) => agent,
        };

        let Some(executor) = self.agents.get_mut(&agent) else {
            debug!(network = %self.network, agent, "Frame for unknown agent");
            return;
        };
        let result = executor.execute(&frame.body);
        let Some(key) = frame.correlation_key else {
            return;
        };

        let reply = match result {
            CommandResult::Completed { message } => {
                debug!(agent, %key, %message, "Command completed");
                InboundMessage::accepted(self.network.clone(), agent, key)
                    .with_payload(message.into_bytes())
            }
            CommandResult::Rejected { message } => {
                debug!(agent, %key, %message, "Command rejected");
                InboundMessage::rejected(self.network.clone(), agent, key, message)
            }
        };
        if self.lost() {
            debug!(agent, %key, "Reply lost");
            return;
        }

        let inbound = self.inbound.clone();
        let latency = self.config.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if let Err(e) = inbound.send(reply).await {
                warn!("Failed to deliver reply: {}", e);
            }
        });
    }

    async fn send_heartbeats(&self) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        for (&agent, executor) in &self.agents {
            if self.lost() {
                continue;
            }
            let message = if executor.is_sleeping() {
                InboundMessage::low_power_heartbeat(self.network.clone(), agent)
            } else {
                InboundMessage::heartbeat(self.network.clone(), agent)
            };
            self.inbound
                .send(message.with_capabilities(self.config.capabilities))
                .await?;
        }
        Ok(())
    }
}
