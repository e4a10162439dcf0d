//! Raft client: sequence-numbered command submission with retransmission.
//!
//! The client holds at most one command in flight. Commands are queued as
//! self-timers at start; a `Command` tick submits the next one to every
//! member of the last known cluster, stamped with the current sequence
//! number, and a `Retransmit` tick resends whatever is still outstanding.
//! The `Applied` acknowledgment that clears a command also reports the
//! cluster effective when it committed, which is how a client learns about
//! membership changes its own reconfiguration commands caused.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::messages::RaftMessage;
use crate::runtime::{Effects, Protocol};

pub const COMMAND_TIMER: &str = "Command";
pub const RETRANSMIT_TIMER: &str = "Retransmit";

/// A command submitted to the cluster: a message kind plus its body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Value,
}

impl PendingCommand {
    fn to_value(&self) -> Value {
        json!({ "type": self.kind, "body": self.body })
    }
}

/// Everything a Raft client keeps between events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    /// Next command sequence number; strictly increasing.
    pub n: u64,
    /// The outstanding command, if any. Never more than one.
    pub inflight: Option<PendingCommand>,
    /// Last known cluster membership.
    pub cluster: Vec<String>,
}

/// The Raft client protocol.
pub struct RaftClient {
    cluster: Vec<String>,
    commands: Vec<PendingCommand>,
}

impl RaftClient {
    pub fn new(cluster: Vec<String>, commands: Vec<PendingCommand>) -> Self {
        Self { cluster, commands }
    }

    fn send_to_cluster(&self, state: &ClientState, fx: &mut Effects, command: &PendingCommand) {
        for node in &state.cluster {
            fx.send(node, &command.kind, command.body.clone());
        }
    }
}

impl Protocol for RaftClient {
    type State = ClientState;

    fn on_start(&mut self, name: &str, state: &mut ClientState, fx: &mut Effects) {
        debug!(name, commands = self.commands.len(), "client starting");
        for command in &self.commands {
            fx.set_timeout(COMMAND_TIMER, command.to_value());
        }
        fx.set_timeout(RETRANSMIT_TIMER, json!({}));
        state.cluster = self.cluster.clone();
    }

    fn on_message(
        &mut self,
        to: &str,
        from: &str,
        kind: &str,
        body: Value,
        state: &mut ClientState,
        _fx: &mut Effects,
    ) {
        let Some(RaftMessage::Applied { n, cluster }) = RaftMessage::decode(kind, body) else {
            debug!(name = to, from, kind, "dropping unrecognized message");
            return;
        };

        if state.inflight.is_some() && n == state.n {
            info!(name = to, n, "command applied");
            state.n += 1;
            state.inflight = None;
            if cluster != state.cluster {
                info!(name = to, ?cluster, "adopting reported cluster membership");
                state.cluster = cluster;
            }
        }
    }

    fn on_timeout(
        &mut self,
        name: &str,
        kind: &str,
        body: Value,
        state: &mut ClientState,
        fx: &mut Effects,
    ) {
        match kind {
            RETRANSMIT_TIMER => {
                if let Some(inflight) = state.inflight.clone() {
                    debug!(name, n = state.n, "retransmitting in-flight command");
                    self.send_to_cluster(state, fx, &inflight);
                }
            }
            COMMAND_TIMER => {
                if state.inflight.is_some() {
                    return;
                }
                let Ok(mut command) = serde_json::from_value::<PendingCommand>(body) else {
                    debug!(name, "dropping malformed command timer body");
                    return;
                };
                if let Value::Object(fields) = &mut command.body {
                    fields.insert("n".to_string(), state.n.into());
                }
                self.send_to_cluster(state, fx, &command);
                state.inflight = Some(command);
            }
            _ => debug!(name, kind, "ignoring unknown timeout"),
        }
    }
}
