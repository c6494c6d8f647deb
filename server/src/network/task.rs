//! Router task and the handle used to talk to it

use super::router::NetworkRouter;
use crate::command::RequestHandle;
use crate::error::DispatchError;
use crate::events::{AgentSnapshot, NetworkStats};
use crate::transport::Transport;
use fleetlink_shared::{
    AgentId, BroadcastPayload, CommandPayload, InboundMessage, LivenessState, NetworkId, Priority,
    RequestId, RequestState,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Control messages from the dispatch core to a router task
#[derive(Debug)]
pub enum RouterCommand {
    Submit {
        request_id: RequestId,
        agent: AgentId,
        payload: CommandPayload,
        priority: Priority,
        max_attempts: u32,
        reply: oneshot::Sender<Result<RequestHandle, DispatchError>>,
    },
    Broadcast {
        payload: BroadcastPayload,
        deadline: Instant,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Correction {
        payload: BroadcastPayload,
        skip_if_idle: bool,
        deadline: Instant,
        reply: oneshot::Sender<Result<bool, DispatchError>>,
    },
    Cancel {
        request_id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Deregister {
        agent: AgentId,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    /// New shared signing epoch; no reply
    SigningEpoch(u64),
    /// Liveness sweep and queue pass at the given time
    Tick {
        now: Instant,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<NetworkStats>,
    },
    Agents {
        reply: oneshot::Sender<Vec<AgentSnapshot>>,
    },
    StateOf {
        agent: AgentId,
        reply: oneshot::Sender<LivenessState>,
    },
    RequestState {
        request_id: RequestId,
        reply: oneshot::Sender<Option<RequestState>>,
    },
    /// Evict all agents and stop the task
    Shutdown,
}

/// Handle to a running router task
#[derive(Debug)]
pub struct RouterHandle {
    id: NetworkId,
    commands: mpsc::Sender<RouterCommand>,
    inbound: mpsc::Sender<InboundMessage>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Spawn the task driving `router`
    pub fn spawn<T: Transport>(router: NetworkRouter<T>) -> Self {
        let id = router.id().clone();
        let (commands_tx, commands_rx) = mpsc::channel(router.config().command_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(router.config().inbound_capacity);

        let task = tokio::spawn(run_router(router, commands_rx, inbound_rx));

        Self {
            id,
            commands: commands_tx,
            inbound: inbound_tx,
            task,
        }
    }

    pub fn id(&self) -> &NetworkId {
        &self.id
    }

    /// Sender the codec layer feeds decoded messages into
    pub fn inbound(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound.clone()
    }

    /// Send a command and wait for the router's answer
    pub async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> RouterCommand,
    ) -> Result<R, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| DispatchError::NetworkClosed(self.id.clone()))?;
        rx.await
            .map_err(|_| DispatchError::NetworkClosed(self.id.clone()))
    }

    /// Send a command without waiting for an answer
    pub async fn notify(&self, command: RouterCommand) -> Result<(), DispatchError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DispatchError::NetworkClosed(self.id.clone()))
    }

    /// Stop the task and wait until every agent has been evicted
    pub async fn shutdown(self) {
        let _ = self.commands.send(RouterCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            debug!(network = %self.id, error = %e, "Router task ended abnormally");
        }
    }
}

/// Main router loop
async fn run_router<T: Transport>(
    mut router: NetworkRouter<T>,
    mut commands: mpsc::Receiver<RouterCommand>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) {
    let mut tick = interval(router.config().tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval(router.config().liveness_sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inbound_open = true;

    info!(
        network = %router.id(),
        transport = router.transport_name(),
        "Router started"
    );

    loop {
        // Replies already delivered are matched before any deadline check
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(RouterCommand::Shutdown) | None => break,
                Some(command) => handle_command(&mut router, command).await,
            },

            message = inbound.recv(), if inbound_open => match message {
                Some(message) => router.on_inbound(message, Instant::now()).await,
                None => {
                    debug!(network = %router.id(), "Inbound channel closed");
                    inbound_open = false;
                }
            },

            _ = tick.tick() => {
                router.pump_all(Instant::now()).await;
            }

            _ = sweep.tick() => {
                router.sweep(Instant::now());
            }
        }
    }

    router.shutdown(Instant::now());
    info!(network = %router.id(), "Router stopped");
}

async fn handle_command<T: Transport>(router: &mut NetworkRouter<T>, command: RouterCommand) {
    match command {
        RouterCommand::Submit {
            request_id,
            agent,
            payload,
            priority,
            max_attempts,
            reply,
        } => {
            let result = router
                .submit(request_id, agent, payload, priority, max_attempts, Instant::now())
                .await;
            let _ = reply.send(result);
        }
        RouterCommand::Broadcast {
            payload,
            deadline,
            reply,
        } => {
            let _ = reply.send(router.broadcast(payload, deadline).await);
        }
        RouterCommand::Correction {
            payload,
            skip_if_idle,
            deadline,
            reply,
        } => {
            let _ = reply.send(router.correction(payload, skip_if_idle, deadline).await);
        }
        RouterCommand::Cancel { request_id, reply } => {
            let _ = reply.send(router.cancel(request_id));
        }
        RouterCommand::Deregister { agent, reply } => {
            let _ = reply.send(router.deregister(agent, Instant::now()));
        }
        RouterCommand::SigningEpoch(epoch) => router.set_signing_epoch(epoch),
        RouterCommand::Tick { now, reply } => {
            router.tick(now).await;
            let _ = reply.send(());
        }
        RouterCommand::Stats { reply } => {
            let _ = reply.send(router.stats());
        }
        RouterCommand::Agents { reply } => {
            let _ = reply.send(router.agents(Instant::now()));
        }
        RouterCommand::StateOf { agent, reply } => {
            let _ = reply.send(router.state_of(agent));
        }
        RouterCommand::RequestState { request_id, reply } => {
            let _ = reply.send(router.request_state(request_id));
        }
        // Handled by the loop
        RouterCommand::Shutdown => {}
    }
}
