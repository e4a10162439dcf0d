//! Node runtime: event dispatch and the effect-accumulation contract.
//!
//! A node is a single sequential loop over its one dispatcher stream: read
//! one event, run exactly one handler, transmit the declared effect batch,
//! repeat. Handlers never touch the socket and the runtime never inspects
//! message contents.
//!
//! # The effect contract
//!
//! A handler receives a private working copy of the node's state and an
//! [`Effects`] accumulator. Sends and timer operations are buffered, never
//! performed; state mutations land on the working copy only. When the
//! handler returns, the copy becomes the authoritative state and the whole
//! batch — messages, timer sets, timer clears, the new state snapshot — is
//! transmitted to the dispatcher as one unit. Delivery order, timer firing,
//! and fault injection are entirely the dispatcher's business, which is what
//! makes protocol runs deterministic and replayable from the outside.
//!
//! A panic inside a handler is unrecoverable and takes the node process down
//! with it; no partial batch is transmitted.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::wire::{
    self, EffectBatch, Event, OutgoingMessage, Register, RegisterReply, TimerRequest,
};

/// Event handlers a protocol implements.
///
/// Handlers not overridden are no-ops. Each handler runs to completion
/// before the node reads its next event, so no intra-node synchronization is
/// ever needed.
pub trait Protocol {
    /// Per-node state, replicated to the dispatcher after every event.
    ///
    /// `Default` is the state a node holds when its `start` event arrives.
    type State: Clone + Default + Serialize;

    /// Called once when the dispatcher starts the node.
    fn on_start(&mut self, _name: &str, _state: &mut Self::State, _fx: &mut Effects) {}

    /// Called for each protocol message delivered to this node.
    fn on_message(
        &mut self,
        _to: &str,
        _from: &str,
        _kind: &str,
        _body: Value,
        _state: &mut Self::State,
        _fx: &mut Effects,
    ) {
    }

    /// Called when a timer this node requested fires.
    fn on_timeout(
        &mut self,
        _name: &str,
        _kind: &str,
        _body: Value,
        _state: &mut Self::State,
        _fx: &mut Effects,
    ) {
    }
}

/// Buffered side effects of a single handler invocation.
pub struct Effects {
    name: String,
    messages: Vec<OutgoingMessage>,
    set_timeouts: Vec<TimerRequest>,
    cleared_timeouts: Vec<TimerRequest>,
}

impl Effects {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Vec::new(),
            set_timeouts: Vec::new(),
            cleared_timeouts: Vec::new(),
        }
    }

    /// Queues a protocol message for `to`.
    pub fn send(&mut self, to: &str, kind: &str, body: Value) {
        self.messages.push(OutgoingMessage {
            from: self.name.clone(),
            to: to.to_string(),
            kind: kind.to_string(),
            body,
        });
    }

    /// Requests a named timer for this node.
    pub fn set_timeout(&mut self, kind: &str, body: Value) {
        self.set_timeouts.push(TimerRequest {
            to: self.name.clone(),
            kind: kind.to_string(),
            body,
        });
    }

    /// Requests cancellation of a previously requested, not-yet-fired timer.
    ///
    /// Whether a clear that races the firing wins is dispatcher-defined; the
    /// node records the request and assumes nothing.
    pub fn clear_timeout(&mut self, kind: &str, body: Value) {
        self.cleared_timeouts.push(TimerRequest {
            to: self.name.clone(),
            kind: kind.to_string(),
            body,
        });
    }

    fn into_batch<S: Serialize>(self, state: &S) -> Result<EffectBatch> {
        let snapshot = serde_json::to_value(state).context("failed to serialize node state")?;
        let mut states = BTreeMap::new();
        states.insert(self.name, snapshot);
        Ok(EffectBatch {
            messages: self.messages,
            set_timeouts: self.set_timeouts,
            cleared_timeouts: self.cleared_timeouts,
            states,
        })
    }
}

/// Single-node dispatch core, independent of any socket.
///
/// [`Node`] wires a core to a real dispatcher over TCP; tests drive cores
/// directly, playing dispatcher themselves.
pub struct NodeCore<P: Protocol> {
    name: String,
    protocol: P,
    state: P::State,
}

impl<P: Protocol> NodeCore<P> {
    pub fn new(name: impl Into<String>, protocol: P) -> Self {
        Self {
            name: name.into(),
            protocol,
            state: P::State::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// The authoritative state as of the last completed event.
    pub fn state(&self) -> &P::State {
        &self.state
    }

    /// Dispatches one event and returns the batch to transmit, or `None`
    /// for `quit`.
    ///
    /// The handler works on a copy of the state; the copy is installed as
    /// authoritative only once the handler has returned.
    pub fn handle(&mut self, event: Event) -> Result<Option<EffectBatch>> {
        let mut fx = Effects::new(&self.name);
        let mut working = match &event {
            Event::Start => P::State::default(),
            _ => self.state.clone(),
        };

        match event {
            Event::Start => self.protocol.on_start(&self.name, &mut working, &mut fx),
            Event::Msg { from, kind, body } => {
                self.protocol
                    .on_message(&self.name, &from, &kind, body, &mut working, &mut fx)
            }
            Event::Timeout { kind, body } => {
                self.protocol
                    .on_timeout(&self.name, &kind, body, &mut working, &mut fx)
            }
            Event::Quit => return Ok(None),
        }

        self.state = working;
        fx.into_batch(&self.state).map(Some)
    }

    /// The batch produced for frames the node ignores: no effects, current
    /// state unchanged.
    pub fn idle_batch(&self) -> Result<EffectBatch> {
        Effects::new(&self.name).into_batch(&self.state)
    }
}

/// A node connected to its dispatcher.
pub struct Node<P: Protocol> {
    core: NodeCore<P>,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl<P: Protocol> Node<P> {
    /// Connects to the dispatcher and performs the registration handshake.
    ///
    /// A refused connection or rejected registration is fatal; the node
    /// never enters its event loop.
    pub async fn register(name: &str, dispatcher: SocketAddr, protocol: P) -> Result<Self> {
        let stream = TcpStream::connect(dispatcher)
            .await
            .with_context(|| format!("failed to connect to dispatcher at {dispatcher}"))?;
        // Frames are tiny and latency-sensitive; don't let Nagle batch them.
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        wire::write_frame(&mut writer, &Register::new(name)).await?;
        let reply: RegisterReply = wire::read_frame(&mut reader)
            .await?
            .context("dispatcher closed the connection during registration")?;
        if !reply.ok {
            bail!("dispatcher rejected registration for '{name}'");
        }
        info!(name, "registered with dispatcher");

        Ok(Self {
            core: NodeCore::new(name, protocol),
            reader,
            writer,
        })
    }

    /// Runs the event loop until the dispatcher sends `quit`.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let frame: Value = match wire::read_frame(&mut self.reader).await? {
                Some(frame) => frame,
                None => bail!("dispatcher closed the connection without quit"),
            };

            let batch = match Event::from_value(frame)? {
                Some(event) => match self.core.handle(event)? {
                    Some(batch) => batch,
                    None => {
                        debug!(name = self.core.name(), "quit received, stopping");
                        break;
                    }
                },
                // Forward-compatible dispatchers may send frames we do not
                // know; acknowledge them with an empty batch.
                None => self.core.idle_batch()?,
            };

            wire::write_frame(&mut self.writer, &batch).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct CounterState {
        count: i64,
        last_from: Option<String>,
    }

    /// Minimal protocol: counts events, echoes messages back to the sender.
    struct Counter;

    impl Protocol for Counter {
        type State = CounterState;

        fn on_start(&mut self, _name: &str, state: &mut CounterState, fx: &mut Effects) {
            state.count = 1;
            fx.set_timeout("Tick", json!({}));
        }

        fn on_message(
            &mut self,
            _to: &str,
            from: &str,
            kind: &str,
            body: Value,
            state: &mut CounterState,
            fx: &mut Effects,
        ) {
            state.count += 1;
            state.last_from = Some(from.to_string());
            fx.send(from, kind, body);
        }

        fn on_timeout(
            &mut self,
            _name: &str,
            _kind: &str,
            _body: Value,
            state: &mut CounterState,
            fx: &mut Effects,
        ) {
            state.count += 1;
            fx.clear_timeout("Tick", json!({}));
        }
    }

    #[test]
    fn start_resets_state_and_batches_effects() {
        let mut core = NodeCore::new("n1", Counter);
        let batch = core
            .handle(Event::Start)
            .expect("handle start")
            .expect("start produces a batch");

        assert_eq!(core.state().count, 1);
        assert_eq!(batch.set_timeouts.len(), 1);
        assert_eq!(batch.set_timeouts[0].to, "n1");
        assert_eq!(batch.set_timeouts[0].kind, "Tick");
        assert_eq!(batch.states["n1"], json!({"count": 1, "last_from": null}));
    }

    #[test]
    fn message_effects_carry_the_node_name_as_sender() {
        let mut core = NodeCore::new("n1", Counter);
        core.handle(Event::Start).expect("handle start");

        let batch = core
            .handle(Event::Msg {
                from: "n2".into(),
                kind: "Ping".into(),
                body: json!({"x": 1}),
            })
            .expect("handle msg")
            .expect("msg produces a batch");

        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].from, "n1");
        assert_eq!(batch.messages[0].to, "n2");
        assert_eq!(batch.messages[0].kind, "Ping");
        assert_eq!(core.state().count, 2);
        assert_eq!(core.state().last_from.as_deref(), Some("n2"));
    }

    #[test]
    fn timeout_records_cleared_timers() {
        let mut core = NodeCore::new("n1", Counter);
        core.handle(Event::Start).expect("handle start");

        let batch = core
            .handle(Event::Timeout {
                kind: "Tick".into(),
                body: json!({}),
            })
            .expect("handle timeout")
            .expect("timeout produces a batch");

        assert_eq!(batch.cleared_timeouts.len(), 1);
        assert_eq!(batch.cleared_timeouts[0].kind, "Tick");
    }

    #[test]
    fn quit_produces_no_batch() {
        let mut core = NodeCore::new("n1", Counter);
        core.handle(Event::Start).expect("handle start");
        assert!(core.handle(Event::Quit).expect("handle quit").is_none());
    }

    #[test]
    fn restart_discards_previous_state() {
        let mut core = NodeCore::new("n1", Counter);
        core.handle(Event::Start).expect("handle start");
        core.handle(Event::Timeout {
            kind: "Tick".into(),
            body: json!({}),
        })
        .expect("handle timeout");
        assert_eq!(core.state().count, 2);

        core.handle(Event::Start).expect("handle restart");
        assert_eq!(core.state().count, 1);
    }

    #[test]
    fn idle_batch_is_empty_but_snapshots_state() {
        let mut core = NodeCore::new("n1", Counter);
        core.handle(Event::Start).expect("handle start");

        let batch = core.idle_batch().expect("idle batch");
        assert!(batch.messages.is_empty());
        assert!(batch.set_timeouts.is_empty());
        assert!(batch.cleared_timeouts.is_empty());
        assert_eq!(batch.states["n1"], json!({"count": 1, "last_from": null}));
    }
}
