//! Command executor - validates and applies commands on a virtual agent

use crate::protocol::{self, Opcode};
use bytes::Bytes;
use fleetlink_shared::AgentId;
use std::collections::HashMap;
use tracing::debug;

/// Result of command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Command accepted and completed successfully
    Completed { message: String },
    /// Command rejected (invalid state, malformed, etc.)
    Rejected { message: String },
}

impl CommandResult {
    fn completed(message: impl Into<String>) -> Self {
        CommandResult::Completed {
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        CommandResult::Rejected {
            message: message.into(),
        }
    }
}

/// Simulated flight state of one agent
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub armed: bool,
    pub airborne: bool,
    /// Flight controller powered down; only status and wake are served
    pub sleeping: bool,
    pub params: HashMap<u8, u8>,
    pub bytes_received: usize,
}

/// Executes commands received by one virtual agent
#[derive(Debug)]
pub struct CommandExecutor {
    agent: AgentId,
    state: AgentState,
}

impl CommandExecutor {
    /// Create a new command executor
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            state: AgentState::default(),
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn is_sleeping(&self) -> bool {
        self.state.sleeping
    }

    /// Execute an encoded command and report the outcome
    pub fn execute(&mut self, body: &Bytes) -> CommandResult {
        let Some((opcode, args)) = protocol::decode(body) else {
            return CommandResult::rejected("Unknown command");
        };
        debug!(agent = self.agent, ?opcode, "Executing command");

        let state = &mut self.state;
        if state.sleeping && !matches!(opcode, Opcode::StatusRequest | Opcode::Wake) {
            return CommandResult::rejected("Flight controller is asleep");
        }

        match opcode {
            Opcode::StatusRequest => CommandResult::completed(format!(
                "armed={} airborne={} sleeping={}",
                state.armed, state.airborne, state.sleeping
            )),
            Opcode::Arm => {
                if state.airborne {
                    return CommandResult::rejected("Already airborne");
                }
                state.armed = true;
                CommandResult::completed("Armed")
            }
            Opcode::Takeoff => {
                if !state.armed {
                    return CommandResult::rejected("Not armed");
                }
                state.airborne = true;
                CommandResult::completed("Taking off")
            }
            Opcode::Land | Opcode::ReturnToHome => {
                if !state.airborne {
                    return CommandResult::rejected("Not airborne");
                }
                state.airborne = false;
                state.armed = false;
                CommandResult::completed("Landing")
            }
            Opcode::ParamSet => match args.as_ref() {
                [index, value] => {
                    state.params.insert(*index, *value);
                    CommandResult::completed(format!("Param {index} = {value}"))
                }
                _ => CommandResult::rejected("Malformed parameter"),
            },
            Opcode::FileChunk => {
                state.bytes_received += args.len();
                CommandResult::completed(format!("{} bytes received", state.bytes_received))
            }
            Opcode::Sleep => {
                if state.airborne {
                    return CommandResult::rejected("Cannot sleep while airborne");
                }
                state.sleeping = true;
                state.armed = false;
                CommandResult::completed("Powering down")
            }
            Opcode::Wake => {
                state.sleeping = false;
                CommandResult::completed("Awake")
            }
            Opcode::Led => CommandResult::completed("Light show"),
        }
    }
}
