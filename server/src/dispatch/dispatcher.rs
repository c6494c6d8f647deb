//! Dispatch Core
//!
//! Top-level coordinator. Owns one router task per network, hands out
//! request ids, fans correction data out to live networks and keeps the
//! shared signing epoch.

use super::signing::SigningClock;
use crate::command::RequestHandle;
use crate::config::{CoreConfig, NetworkConfig};
use crate::error::{ConfigError, DispatchError};
use crate::events::{AgentSnapshot, CoreEvent, NetworkStats};
use crate::network::{NetworkRouter, RouterCommand, RouterHandle};
use crate::transport::Transport;
use fleetlink_shared::{
    AgentId, BroadcastPayload, CommandPayload, InboundMessage, LivenessState, NetworkId, Priority,
    RequestId, RequestState,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Coordinates every network router and exposes the public command API
pub struct DispatchCore {
    config: CoreConfig,
    routers: BTreeMap<NetworkId, RouterHandle>,
    request_id: AtomicU64,
    signing: SigningClock,
    events: broadcast::Sender<CoreEvent>,
}

impl DispatchCore {
    /// Create a core with no networks attached.
    ///
    /// Networks listed in `config.networks` are attached with [`attach`].
    ///
    /// [`attach`]: DispatchCore::attach
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            config,
            routers: BTreeMap::new(),
            request_id: AtomicU64::new(0),
            signing: SigningClock::new(),
            events,
        })
    }

    /// Attach a transport to a network declared in the core configuration
    pub fn attach<T: Transport>(
        &mut self,
        network: &NetworkId,
        transport: T,
    ) -> Result<mpsc::Sender<InboundMessage>, DispatchError> {
        let config = self
            .config
            .networks
            .iter()
            .find(|c| &c.id == network)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownNetwork(network.clone()))?;
        self.spawn_router(config, transport)
    }

    /// Start routing a network over the given transport.
    ///
    /// Returns the sender the codec layer delivers decoded messages into.
    pub fn add_network<T: Transport>(
        &mut self,
        config: NetworkConfig,
        transport: T,
    ) -> Result<mpsc::Sender<InboundMessage>, DispatchError> {
        config.validate()?;
        let sender = self.spawn_router(config.clone(), transport)?;
        match self.config.networks.iter_mut().find(|c| c.id == config.id) {
            Some(declared) => *declared = config,
            None => self.config.networks.push(config),
        }
        Ok(sender)
    }

    fn spawn_router<T: Transport>(
        &mut self,
        config: NetworkConfig,
        transport: T,
    ) -> Result<mpsc::Sender<InboundMessage>, DispatchError> {
        if self.routers.contains_key(&config.id) {
            return Err(DispatchError::DuplicateNetwork(config.id));
        }

        let id = config.id.clone();
        let mut router = NetworkRouter::new(config, transport, self.events.clone(), Instant::now());
        router.set_signing_epoch(self.signing.current());
        let handle = RouterHandle::spawn(router);
        let inbound = handle.inbound();
        self.routers.insert(id.clone(), handle);

        info!(network = %id, "Network added");
        Ok(inbound)
    }

    /// Stop a network's router, failing its pending commands with `AgentGone`
    pub async fn remove_network(&mut self, network: &NetworkId) -> Result<(), DispatchError> {
        let handle = self
            .routers
            .remove(network)
            .ok_or_else(|| DispatchError::UnknownNetwork(network.clone()))?;
        self.config.networks.retain(|c| &c.id != network);
        handle.shutdown().await;
        info!(network = %network, "Network removed");
        Ok(())
    }

    /// Ids of all attached networks, in order
    pub fn networks(&self) -> Vec<NetworkId> {
        self.routers.keys().cloned().collect()
    }

    /// Receive liveness, registration and command outcome events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    fn router(&self, network: &NetworkId) -> Result<&RouterHandle, DispatchError> {
        self.routers
            .get(network)
            .ok_or_else(|| DispatchError::UnknownNetwork(network.clone()))
    }

    fn next_request_id(&self) -> RequestId {
        self.request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue a unicast command for an agent.
    ///
    /// `max_attempts` of zero uses the network's default.
    pub async fn submit_command(
        &self,
        network: &NetworkId,
        agent: AgentId,
        payload: CommandPayload,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<RequestHandle, DispatchError> {
        let router = self.router(network)?;
        let request_id = self.next_request_id();
        router
            .call(|reply| RouterCommand::Submit {
                request_id,
                agent,
                payload,
                priority,
                max_attempts,
                reply,
            })
            .await?
    }

    /// Rate-limited broadcast to every agent of a network.
    ///
    /// Fails with `RateLimited` if tokens are not available within the
    /// network's broadcast grace period.
    pub async fn broadcast(
        &self,
        network: &NetworkId,
        payload: BroadcastPayload,
    ) -> Result<(), DispatchError> {
        let router = self.router(network)?;
        let grace = self.network_config(network)?.broadcast_grace;
        let deadline = Instant::now() + grace;
        router
            .call(|reply| RouterCommand::Broadcast {
                payload,
                deadline,
                reply,
            })
            .await?
    }

    /// Send correction data to every network that uses the correction
    /// stream.
    ///
    /// With `exclude_idle_networks`, networks without any online agent are
    /// skipped. Returns the networks that received the payload; failures on
    /// one network do not stop the others.
    pub async fn fan_out_correction(
        &self,
        payload: BroadcastPayload,
        exclude_idle_networks: bool,
    ) -> Vec<NetworkId> {
        let sends = self.routers.iter().map(|(id, router)| {
            let payload = payload.clone();
            let deadline = Instant::now()
                + self
                    .network_config(id)
                    .map(|c| c.broadcast_grace)
                    .unwrap_or_default();
            async move {
                let result = router
                    .call(|reply| RouterCommand::Correction {
                        payload,
                        skip_if_idle: exclude_idle_networks,
                        deadline,
                        reply,
                    })
                    .await
                    .and_then(|sent| sent);
                (id, result)
            }
        });

        let mut delivered = Vec::new();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(true) => delivered.push(id.clone()),
                Ok(false) => {}
                Err(e) => warn!(network = %id, error = %e, "Correction fan-out failed"),
            }
        }
        delivered
    }

    /// Advance the shared signing epoch and push it to every network
    pub async fn synchronize_signing_epoch(&self, now: SystemTime) -> u64 {
        let epoch = self.signing.advance(now);
        for (id, router) in &self.routers {
            if let Err(e) = router.notify(RouterCommand::SigningEpoch(epoch)).await {
                warn!(network = %id, error = %e, "Failed to push signing epoch");
            }
        }
        debug!(epoch, "Signing epoch synchronized");
        epoch
    }

    /// Current value of the shared signing epoch
    pub fn signing_epoch(&self) -> u64 {
        self.signing.current()
    }

    /// Drive every router's liveness sweep and command queues at `now`
    pub async fn tick(&self, now: Instant) {
        let ticks = self.routers.iter().map(|(id, router)| async move {
            if let Err(e) = router.call(|reply| RouterCommand::Tick { now, reply }).await {
                warn!(network = %id, error = %e, "Tick failed");
            }
        });
        join_all(ticks).await;
    }

    /// Request cancellation of a pending command
    pub async fn cancel(
        &self,
        network: &NetworkId,
        request_id: RequestId,
    ) -> Result<bool, DispatchError> {
        self.router(network)?
            .call(|reply| RouterCommand::Cancel { request_id, reply })
            .await
    }

    /// Forget an agent; its pending commands fail with `AgentGone`
    pub async fn deregister_agent(
        &self,
        network: &NetworkId,
        agent: AgentId,
    ) -> Result<(), DispatchError> {
        self.router(network)?
            .call(|reply| RouterCommand::Deregister { agent, reply })
            .await?
    }

    pub async fn agents(&self, network: &NetworkId) -> Result<Vec<AgentSnapshot>, DispatchError> {
        self.router(network)?
            .call(|reply| RouterCommand::Agents { reply })
            .await
    }

    pub async fn network_stats(&self, network: &NetworkId) -> Result<NetworkStats, DispatchError> {
        self.router(network)?
            .call(|reply| RouterCommand::Stats { reply })
            .await
    }

    /// Liveness state of an agent; `Unknown` if never seen
    pub async fn state_of(
        &self,
        network: &NetworkId,
        agent: AgentId,
    ) -> Result<LivenessState, DispatchError> {
        self.router(network)?
            .call(|reply| RouterCommand::StateOf { agent, reply })
            .await
    }

    /// State of a pending request, or of a finished one within the result
    /// grace period
    pub async fn request_state(
        &self,
        network: &NetworkId,
        request_id: RequestId,
    ) -> Result<Option<RequestState>, DispatchError> {
        self.router(network)?
            .call(|reply| RouterCommand::RequestState { request_id, reply })
            .await
    }

    fn network_config(&self, network: &NetworkId) -> Result<&NetworkConfig, DispatchError> {
        self.config
            .networks
            .iter()
            .find(|c| &c.id == network)
            .ok_or_else(|| DispatchError::UnknownNetwork(network.clone()))
    }

    /// Keep the signing epoch synchronized while `work` runs, and return
    /// its output.
    ///
    /// Routers tick themselves; this loop only owns the shared epoch. Call
    /// [`shutdown`] afterwards to stop the routers.
    ///
    /// [`shutdown`]: DispatchCore::shutdown
    pub async fn run_until<F: Future>(&self, work: F) -> F::Output {
        let mut signing = interval(self.config.signing_sync_interval);
        signing.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        info!(networks = self.routers.len(), "Dispatch core running");
        loop {
            tokio::select! {
                biased;

                output = &mut work => break output,
                _ = signing.tick() => {
                    self.synchronize_signing_epoch(SystemTime::now()).await;
                }
            }
        }
    }

    /// Stop every router, failing pending commands with `AgentGone`
    pub async fn shutdown(&mut self) {
        let routers = std::mem::take(&mut self.routers);
        join_all(routers.into_values().map(RouterHandle::shutdown)).await;
        info!("Dispatch core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn core_with(networks: &[&str]) -> DispatchCore {
        let config = CoreConfig {
            networks: networks.iter().map(|id| NetworkConfig::new(*id)).collect(),
            ..Default::default()
        };
        DispatchCore::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_network() {
        let core = core_with(&[]);
        let err = core
            .submit_command(
                &NetworkId::from("nope"),
                1,
                CommandPayload::fire_and_forget(&b"x"[..]),
                Priority::Normal,
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::UnknownNetwork(NetworkId::from("nope")));
    }

    #[tokio::test]
    async fn test_attach_declared_network_only() {
        let mut core = core_with(&["radio"]);
        let (transport, _frames) = ChannelTransport::pair("radio", 8);
        assert!(core.attach(&NetworkId::from("radio"), transport).is_ok());

        let (transport, _frames) = ChannelTransport::pair("wifi", 8);
        assert_eq!(
            core.attach(&NetworkId::from("wifi"), transport).unwrap_err(),
            DispatchError::UnknownNetwork(NetworkId::from("wifi"))
        );
        assert_eq!(core.networks(), vec![NetworkId::from("radio")]);
    }

    #[tokio::test]
    async fn test_duplicate_network_rejected() {
        let mut core = core_with(&[]);
        let (transport, _a) = ChannelTransport::pair("a", 8);
        core.add_network(NetworkConfig::new("n1"), transport).unwrap();
        let (transport, _b) = ChannelTransport::pair("b", 8);
        assert_eq!(
            core.add_network(NetworkConfig::new("n1"), transport)
                .unwrap_err(),
            DispatchError::DuplicateNetwork(NetworkId::from("n1"))
        );
    }

    #[tokio::test]
    async fn test_invalid_network_config_rejected() {
        let mut core = core_with(&[]);
        let mut config = NetworkConfig::new("n1");
        config.per_agent_queue_depth = 0;
        let (transport, _frames) = ChannelTransport::pair("a", 8);
        assert!(matches!(
            core.add_network(config, transport),
            Err(DispatchError::Config(ConfigError::Zero { .. }))
        ));
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let core = core_with(&[]);
        let a = core.next_request_id();
        let b = core.next_request_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_signing_epoch_pushed_to_routers() {
        let mut core = core_with(&[]);
        let (transport, mut frames) = ChannelTransport::pair("a", 8);
        core.add_network(NetworkConfig::new("n1"), transport).unwrap();

        let epoch = core.synchronize_signing_epoch(SystemTime::now()).await;
        assert_eq!(core.signing_epoch(), epoch);

        core.broadcast(
            &NetworkId::from("n1"),
            BroadcastPayload::new(fleetlink_shared::BroadcastKind::Signing, &b"s"[..]),
        )
        .await
        .unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.signing_epoch, epoch);
    }

    #[tokio::test]
    async fn test_remove_network() {
        let mut core = core_with(&[]);
        let (transport, _frames) = ChannelTransport::pair("a", 8);
        core.add_network(NetworkConfig::new("n1"), transport).unwrap();

        core.remove_network(&NetworkId::from("n1")).await.unwrap();
        assert!(core.networks().is_empty());
        assert!(core.remove_network(&NetworkId::from("n1")).await.is_err());
    }

    #[tokio::test]
    async fn test_run_until_syncs_epoch_while_work_runs() {
        let mut core = core_with(&[]);
        let (transport, mut frames) = ChannelTransport::pair("a", 8);
        let network = NetworkId::from("n1");
        let inbound = core.add_network(NetworkConfig::new("n1"), transport).unwrap();

        inbound
            .send(InboundMessage::heartbeat(network.clone(), 7))
            .await
            .unwrap();
        for _ in 0..200 {
            if core.state_of(&network, 7).await.unwrap() == LivenessState::Online {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let handle = core
            .submit_command(
                &network,
                7,
                CommandPayload::expecting_reply(&b"go"[..], fleetlink_shared::CorrelationKey(1)),
                Priority::Normal,
                1,
            )
            .await
            .unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.correlation_key, Some(fleetlink_shared::CorrelationKey(1)));

        assert_eq!(core.signing_epoch(), 0);
        let output = core
            .run_until(async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                "done"
            })
            .await;
        assert_eq!(output, "done");
        assert!(core.signing_epoch() > 0);
        assert_eq!(core.networks(), vec![network.clone()]);

        core.shutdown().await;
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.reason, fleetlink_shared::FailureReason::AgentGone);
    }
}
