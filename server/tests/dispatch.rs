//! End-to-end behaviour of the dispatch core over in-memory transports

use fleetlink_server::{
    ChannelTransport, CoreConfig, CoreEvent, DispatchCore, DispatchError, NetworkConfig,
};
use fleetlink_shared::{
    AgentId, BroadcastKind, BroadcastPayload, CommandPayload, CorrelationKey, Destination,
    FailureReason, InboundMessage, LivenessState, NetworkId, OutboundFrame, Priority,
    RequestState,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Link {
    id: NetworkId,
    inbound: mpsc::Sender<InboundMessage>,
    frames: mpsc::Receiver<OutboundFrame>,
}

fn core() -> DispatchCore {
    DispatchCore::new(CoreConfig::default()).unwrap()
}

fn fast_network(id: &str) -> NetworkConfig {
    let mut config = NetworkConfig::new(id);
    config.min_timeout = Duration::from_millis(100);
    config.initial_timeout = Duration::from_millis(100);
    config.max_timeout = Duration::from_millis(1000);
    config
}

fn attach(core: &mut DispatchCore, config: NetworkConfig) -> Link {
    let id = config.id.clone();
    let (transport, frames) = ChannelTransport::pair(id.as_str(), 256);
    let inbound = core.add_network(config, transport).unwrap();
    Link {
        id,
        inbound,
        frames,
    }
}

async fn heartbeat(link: &Link, agent: AgentId) {
    link.inbound
        .send(InboundMessage::heartbeat(link.id.clone(), agent))
        .await
        .unwrap();
}

/// Heartbeat from an agent and wait until the router has registered it
async fn bring_online(core: &DispatchCore, link: &Link, agent: AgentId) {
    heartbeat(link, agent).await;
    for _ in 0..200 {
        if core.state_of(&link.id, agent).await.unwrap() == LivenessState::Online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("agent {agent} never came online");
}

fn command(key: u64) -> CommandPayload {
    CommandPayload::expecting_reply(format!("cmd-{key}").into_bytes(), CorrelationKey(key))
}

/// Accept every command addressed to one of `responsive`
fn spawn_responder(link: Link, responsive: HashSet<AgentId>) {
    let Link {
        id,
        inbound,
        mut frames,
    } = link;
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let (Destination::Unicast(agent), Some(key)) =
                (frame.destination, frame.correlation_key)
            {
                if responsive.contains(&agent) {
                    let reply = InboundMessage::accepted(id.clone(), agent, key);
                    if inbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[tokio::test(start_paused = true)]
async fn third_submission_to_full_queue_is_backpressure() {
    let mut core = core();
    let mut config = fast_network("n1");
    config.per_agent_queue_depth = 2;
    let link = attach(&mut core, config);
    bring_online(&core, &link, 7).await;

    let net = link.id.clone();
    let _first = core
        .submit_command(&net, 7, command(1), Priority::Normal, 3)
        .await
        .unwrap();
    let _second = core
        .submit_command(&net, 7, command(2), Priority::Normal, 3)
        .await
        .unwrap();

    let err = core
        .submit_command(&net, 7, command(3), Priority::Normal, 3)
        .await
        .unwrap_err();
    assert!(err.is_backpressure());
    assert_eq!(
        err,
        DispatchError::QueueFull {
            network: net.clone(),
            agent: 7,
            depth: 2
        }
    );

    // Bounded queue: never more pending than the configured depth
    let agents = core.agents(&net).await.unwrap();
    assert_eq!(agents[0].queue_depth, 2);
    assert_eq!(core.network_stats(&net).await.unwrap().queue_depth, 2);
}

#[tokio::test(start_paused = true)]
async fn silent_agent_fails_with_timeout_after_all_attempts() {
    let mut core = core();
    let mut link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;

    let start = Instant::now();
    let handle = core
        .submit_command(&link.id, 7, command(1), Priority::Normal, 3)
        .await
        .unwrap();

    let failure = handle.wait().await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(failure.reason, FailureReason::Timeout);
    assert_eq!(failure.attempts, 3);
    assert!(elapsed >= Duration::from_millis(300), "failed after {elapsed:?}");
    // Terminal within max_attempts * max_timeout plus one tick
    assert!(elapsed <= Duration::from_millis(3 * 1000 + 50), "failed after {elapsed:?}");

    let mut attempts = 0;
    while link.frames.try_recv().is_ok() {
        attempts += 1;
    }
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn silent_agent_goes_offline_after_online_timeout() {
    let mut core = core();
    let mut config = NetworkConfig::new("n1");
    config.online_timeout = Duration::from_secs(1);
    let link = attach(&mut core, config);
    let mut events = core.subscribe();

    let t0 = Instant::now();
    bring_online(&core, &link, 7).await;

    core.tick(t0 + Duration::from_millis(500)).await;
    assert_eq!(
        core.state_of(&link.id, 7).await.unwrap(),
        LivenessState::Online
    );

    core.tick(t0 + Duration::from_millis(1500)).await;
    assert_eq!(
        core.state_of(&link.id, 7).await.unwrap(),
        LivenessState::Offline
    );

    // Exactly one offline transition is published
    core.tick(t0 + Duration::from_millis(2500)).await;
    let mut offline_events = 0;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Liveness {
            to: LivenessState::Offline,
            ..
        } = event
        {
            offline_events += 1;
        }
    }
    assert_eq!(offline_events, 1);

    // One packet brings it straight back
    bring_online(&core, &link, 7).await;
}

#[tokio::test]
async fn correction_fan_out_skips_networks_without_online_agents() {
    let mut core = core();
    let mut live = attach(&mut core, NetworkConfig::new("live"));
    let mut idle = attach(&mut core, NetworkConfig::new("idle"));
    bring_online(&core, &live, 1).await;

    let delivered = core
        .fan_out_correction(BroadcastPayload::correction(&b"rtcm3"[..]), true)
        .await;
    assert_eq!(delivered, vec![NetworkId::from("live")]);

    let frame = live.frames.try_recv().unwrap();
    assert_eq!(frame.destination, Destination::Broadcast);
    assert_eq!(&frame.body[..], b"rtcm3");
    assert!(idle.frames.try_recv().is_err());

    let stats = core.network_stats(&live.id).await.unwrap();
    assert_eq!(stats.broadcasts_of(BroadcastKind::Correction), 1);

    // Without idle exclusion both networks receive it
    let delivered = core
        .fan_out_correction(BroadcastPayload::correction(&b"rtcm3"[..]), false)
        .await;
    assert_eq!(delivered.len(), 2);
    assert!(idle.frames.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn only_one_command_awaits_reply_per_agent() {
    let mut core = core();
    let mut link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;

    let mut handles = Vec::new();
    for key in 1..=3 {
        handles.push(
            core.submit_command(&link.id, 7, command(key), Priority::Normal, 3)
                .await
                .unwrap(),
        );
    }

    let mut awaiting = 0;
    for handle in &handles {
        let state = core.request_state(&link.id, handle.request_id).await.unwrap();
        if state == Some(RequestState::AwaitingAck) {
            awaiting += 1;
        }
    }
    assert_eq!(awaiting, 1);

    let frame = link.frames.try_recv().unwrap();
    assert_eq!(frame.correlation_key, Some(CorrelationKey(1)));
    assert!(link.frames.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_agent_does_not_delay_others() {
    let mut core = core();
    let link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 1).await;
    bring_online(&core, &link, 2).await;
    let net = link.id.clone();
    spawn_responder(link, HashSet::from([2]));

    let slow = core
        .submit_command(&net, 1, command(10), Priority::Normal, 3)
        .await
        .unwrap();
    let fast = core
        .submit_command(&net, 2, command(20), Priority::Normal, 3)
        .await
        .unwrap();
    let slow_id = slow.request_id;

    let start = Instant::now();
    let success = fast.wait().await.unwrap();
    assert_eq!(success.attempts, 1);
    assert!(start.elapsed() < Duration::from_millis(100));

    // Agent 1 is still on its first attempt
    assert_eq!(
        core.request_state(&net, slow_id).await.unwrap(),
        Some(RequestState::AwaitingAck)
    );
    assert_eq!(
        slow.wait().await.unwrap_err().reason,
        FailureReason::Timeout
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_command_is_not_retried() {
    let mut core = core();
    let mut link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;

    let handle = core
        .submit_command(&link.id, 7, command(5), Priority::Normal, 3)
        .await
        .unwrap();
    let frame = link.frames.recv().await.unwrap();
    link.inbound
        .send(InboundMessage::rejected(
            link.id.clone(),
            7,
            frame.correlation_key.unwrap(),
            "not armed",
        ))
        .await
        .unwrap();

    let failure = handle.wait().await.unwrap_err();
    assert_eq!(failure.reason, FailureReason::Rejected);
    assert_eq!(failure.attempts, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(link.frames.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn urgent_command_dispatches_before_queued_normal() {
    let mut core = core();
    let mut link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;
    let net = link.id.clone();

    let mut handles = Vec::new();
    for (key, priority) in [
        (1, Priority::Normal),
        (2, Priority::Normal),
        (3, Priority::Urgent),
    ] {
        handles.push(
            core.submit_command(&net, 7, command(key), priority, 1)
                .await
                .unwrap(),
        );
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let frame = link.frames.recv().await.unwrap();
        let key = frame.correlation_key.unwrap();
        order.push(key.0);
        link.inbound
            .send(InboundMessage::accepted(net.clone(), 7, key))
            .await
            .unwrap();
    }
    // Command 1 was already in flight when the urgent one arrived
    assert_eq!(order, vec![1, 3, 2]);

    for handle in handles {
        assert!(handle.wait().await.is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn deregistered_agent_fails_pending_commands() {
    let mut core = core();
    let link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;
    let mut events = core.subscribe();

    let handle = core
        .submit_command(&link.id, 7, command(1), Priority::Normal, 3)
        .await
        .unwrap();
    core.deregister_agent(&link.id, 7).await.unwrap();

    assert_eq!(
        handle.wait().await.unwrap_err().reason,
        FailureReason::AgentGone
    );
    assert_eq!(
        core.state_of(&link.id, 7).await.unwrap(),
        LivenessState::Unknown
    );
    assert_eq!(
        core.submit_command(&link.id, 7, command(2), Priority::Normal, 3)
            .await
            .unwrap_err(),
        DispatchError::UnknownAgent {
            network: link.id.clone(),
            agent: 7
        }
    );

    let mut evicted = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CoreEvent::AgentEvicted { agent: 7, .. }) {
            evicted = true;
        }
    }
    assert!(evicted);
}

#[tokio::test(start_paused = true)]
async fn removing_network_fails_pending_commands() {
    let mut core = core();
    let link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;

    let handle = core
        .submit_command(&link.id, 7, command(1), Priority::Normal, 3)
        .await
        .unwrap();
    core.remove_network(&link.id).await.unwrap();

    assert_eq!(
        handle.wait().await.unwrap_err().reason,
        FailureReason::AgentGone
    );
    assert_eq!(
        core.state_of(&link.id, 7).await.unwrap_err(),
        DispatchError::UnknownNetwork(link.id.clone())
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_command_reports_cancelled() {
    let mut core = core();
    let link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;

    let handle = core
        .submit_command(&link.id, 7, command(1), Priority::Normal, 3)
        .await
        .unwrap();
    assert!(core.cancel(&link.id, handle.request_id).await.unwrap());

    let request_id = handle.request_id;
    let failure = handle.wait().await.unwrap_err();
    assert_eq!(failure.reason, FailureReason::Cancelled);
    assert_eq!(
        core.request_state(&link.id, request_id).await.unwrap(),
        Some(RequestState::Cancelled)
    );
    assert!(!core.cancel(&link.id, request_id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_completes_on_transmission() {
    let mut core = core();
    let mut link = attach(&mut core, fast_network("n1"));
    bring_online(&core, &link, 7).await;

    let handle = core
        .submit_command(
            &link.id,
            7,
            CommandPayload::fire_and_forget(&b"led on"[..]),
            Priority::Normal,
            0,
        )
        .await
        .unwrap();

    let success = handle.wait().await.unwrap();
    assert_eq!(success.attempts, 1);
    assert_eq!(success.rtt, None);
    assert!(link.frames.try_recv().is_ok());
}
