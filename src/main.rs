mod command;
mod connection;
mod protocol;

use anyhow::Result;
use connection::{LinkConfig, VirtualLink};
use fleetlink_server::{
    AgentSnapshot, ChannelTransport, CoreConfig, CoreEvent, DispatchCore, NetworkConfig, RateLimit,
};
use fleetlink_shared::{BroadcastPayload, Capabilities, CorrelationKey, LivenessState, Priority};
use protocol::Opcode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Agent can receive file chunks
const FILE_TRANSFER: Capabilities = Capabilities(0b10);

/// Commands cycled through by the mission loop
const MISSION: [Opcode; 8] = [
    Opcode::StatusRequest,
    Opcode::Arm,
    Opcode::Takeoff,
    Opcode::ParamSet,
    Opcode::Led,
    Opcode::FileChunk,
    Opcode::ReturnToHome,
    Opcode::StatusRequest,
];

fn networks() -> Vec<(NetworkConfig, LinkConfig)> {
    let mut radio = NetworkConfig::new("radio");
    radio.max_agent_count = Some(8);
    radio.broadcast_rate_limit = Some(RateLimit::new(20.0, 5));
    radio.uses_correction_stream = true;
    let radio_link = LinkConfig {
        agents: (1..=6).collect(),
        capabilities: Capabilities(0b01),
        latency: Duration::from_millis(40),
        packet_loss: 0.1,
        ..Default::default()
    };

    let mut wifi = NetworkConfig::new("wifi");
    wifi.uses_correction_stream = true;
    wifi.min_timeout = Duration::from_millis(50);
    let wifi_link = LinkConfig {
        agents: (1..=3).collect(),
        capabilities: Capabilities(0b11),
        latency: Duration::from_millis(5),
        ..Default::default()
    };

    // Declared with no agents, so correction fan-out skips it
    let mut spare = NetworkConfig::new("spare");
    spare.uses_correction_stream = true;
    let spare_link = LinkConfig {
        agents: Vec::new(),
        ..Default::default()
    };

    vec![(radio, radio_link), (wifi, wifi_link), (spare, spare_link)]
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let fleet = networks();
    let config = CoreConfig {
        networks: fleet.iter().map(|(network, _)| network.clone()).collect(),
        ..Default::default()
    };
    let mut core = DispatchCore::new(config)?;

    for (network, link) in fleet {
        let (transport, frames) = ChannelTransport::pair(network.id.as_str(), 64);
        let inbound = core.attach(&network.id, transport)?;
        let link = VirtualLink::new(network.id.clone(), link, inbound);
        tokio::spawn(link.run(frames));
    }
    info!("Virtual fleet starting: {:?}", core.networks());

    let events = core.subscribe();
    core.run_until(fly(&core, events)).await;

    core.shutdown().await;
    Ok(())
}

/// Main event loop; the core keeps the signing epoch in sync meanwhile
async fn fly(core: &DispatchCore, mut events: broadcast::Receiver<CoreEvent>) {
    let correlation = AtomicU64::new(0);
    let mut step = 0usize;

    let mut corrections = interval(Duration::from_millis(500));
    let mut missions = interval(Duration::from_secs(2));
    let mut report = interval(Duration::from_secs(10));
    for ticker in [&mut corrections, &mut missions, &mut report] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = corrections.tick() => {
                let body = correlation.load(Ordering::Relaxed).to_be_bytes();
                let delivered = core
                    .fan_out_correction(BroadcastPayload::correction(body.to_vec()), true)
                    .await;
                debug!("Correction delivered to {:?}", delivered);
            }
            _ = missions.tick() => {
                let opcode = MISSION[step % MISSION.len()];
                step += 1;
                run_mission_step(core, opcode, &correlation).await;
            }
            _ = report.tick() => report_stats(core).await,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} core events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }
}

async fn report_stats(core: &DispatchCore) {
    for network in core.networks() {
        let stats = match core.network_stats(&network).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Stats unavailable for {}: {}", network, e);
                continue;
            }
        };
        info!(
            "[{}] agents={}/{} sent={} acked={} failed={} retries={} unmatched={} queued={}",
            network,
            stats.agents_online,
            stats.agents,
            stats.unicast_sent,
            stats.acked,
            stats.failed,
            stats.retries,
            stats.unmatched_replies,
            stats.queue_depth,
        );
        if let Some(limiter) = stats.rate_limiter {
            debug!(
                "[{}] rate limiter granted={} denied={} available={:.1}",
                network, limiter.tokens_granted, limiter.requests_denied, limiter.available
            );
        }
    }
}

/// Whether `opcode` makes sense for this agent right now
fn accepts(agent: &AgentSnapshot, opcode: Opcode) -> bool {
    agent.liveness == LivenessState::Online
        && (opcode != Opcode::FileChunk || agent.capabilities.contains(FILE_TRANSFER))
}

/// Send one mission command to every online agent of every network
async fn run_mission_step(core: &DispatchCore, opcode: Opcode, correlation: &AtomicU64) {
    for network in core.networks() {
        let agents = match core.agents(&network).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!("Cannot list agents of {}: {}", network, e);
                continue;
            }
        };

        for agent in agents.into_iter().filter(|a| accepts(a, opcode)) {
            let key = CorrelationKey(correlation.fetch_add(1, Ordering::Relaxed) + 1);
            let args: &[u8] = match opcode {
                Opcode::ParamSet => &[1, 42],
                Opcode::FileChunk => &[0; 32],
                _ => &[],
            };
            let priority = if opcode == Opcode::ReturnToHome {
                Priority::Urgent
            } else {
                Priority::Normal
            };

            let payload = protocol::command(opcode, key, args);
            match core
                .submit_command(&network, agent.agent, payload, priority, 0)
                .await
            {
                Ok(handle) => {
                    let network = network.clone();
                    tokio::spawn(async move {
                        let request = handle.request_id;
                        match handle.wait().await {
                            Ok(done) => debug!(
                                "[{}] agent {} {:?} done (request {}, attempts {}, rtt {:?})",
                                network, agent.agent, opcode, request, done.attempts, done.rtt
                            ),
                            Err(failure) => warn!(
                                "[{}] agent {} {:?} failed: {} {}",
                                network,
                                agent.agent,
                                opcode,
                                failure,
                                failure.detail.as_deref().unwrap_or("")
                            ),
                        }
                    });
                }
                Err(e) if e.is_backpressure() => {
                    debug!("[{}] agent {} busy: {}", network, agent.agent, e)
                }
                Err(e) => error!("[{}] submit to agent {} failed: {}", network, agent.agent, e),
            }
        }
    }
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::Liveness {
            network,
            agent,
            from,
            to,
        } => info!("[{}] agent {}: {} -> {}", network, agent, from, to),
        CoreEvent::AgentRegistered { network, agent } => {
            info!("[{}] agent {} registered", network, agent)
        }
        CoreEvent::AgentEvicted { network, agent } => {
            info!("[{}] agent {} evicted", network, agent)
        }
        CoreEvent::CommandFinished { .. } => {}
    }
}
