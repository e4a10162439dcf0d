#![allow(dead_code)]

//! In-process dispatcher for driving protocol nodes deterministically.
//!
//! `TestCluster` owns every node's [`NodeCore`], the queue of undelivered
//! messages, and the table of pending timers, exactly the way the real
//! dispatcher owns sockets and clocks. Tests choose which timers fire and
//! when messages flow, so delivery orders that would be races on a real
//! network become scripted scenarios here.

use std::collections::{BTreeSet, VecDeque};

use raft_shim::client::{ClientState, PendingCommand, RaftClient};
use raft_shim::runtime::NodeCore;
use raft_shim::server::{RaftServer, Role, ServerState, ELECTION_TIMER, HEARTBEAT_TIMER};
use raft_shim::wire::{EffectBatch, Event, OutgoingMessage, TimerRequest};

pub struct TestCluster {
    servers: Vec<NodeCore<RaftServer>>,
    clients: Vec<NodeCore<RaftClient>>,
    /// Messages emitted but not yet delivered, in emission order.
    pub queue: VecDeque<OutgoingMessage>,
    /// Pending timers. Timers stand until cleared; the dispatcher may fire
    /// a standing timer as often as it likes.
    pub timers: Vec<TimerRequest>,
    /// Every message any node has ever emitted, for whole-run assertions.
    pub sent: Vec<OutgoingMessage>,
    /// Nodes on the minority side of a partition; traffic crossing the
    /// boundary is dropped, traffic within a side still flows.
    partitioned: BTreeSet<String>,
}

impl TestCluster {
    /// A cluster of servers, each configured with the full name list.
    pub fn with_servers(names: &[&str]) -> Self {
        let mut cluster = Self {
            servers: Vec::new(),
            clients: Vec::new(),
            queue: VecDeque::new(),
            timers: Vec::new(),
            sent: Vec::new(),
            partitioned: BTreeSet::new(),
        };
        for name in names {
            cluster.add_server(name, names);
        }
        cluster
    }

    pub fn add_server(&mut self, name: &str, initial_cluster: &[&str]) {
        let members = initial_cluster.iter().map(|s| s.to_string()).collect();
        self.servers
            .push(NodeCore::new(name, RaftServer::new(members)));
    }

    pub fn add_client(&mut self, name: &str, cluster: &[&str], commands: Vec<PendingCommand>) {
        let members = cluster.iter().map(|s| s.to_string()).collect();
        self.clients
            .push(NodeCore::new(name, RaftClient::new(members, commands)));
    }

    /// Sends `start` to one node, typically one added after the rest of the
    /// run was already under way.
    pub fn start(&mut self, name: &str) {
        if let Some(batch) = self.handle_at(name, Event::Start) {
            self.absorb(batch);
        }
    }

    /// Sends `start` to every node, servers first.
    pub fn start_all(&mut self) {
        let names: Vec<String> = self
            .servers
            .iter()
            .map(|core| core.name().to_string())
            .chain(self.clients.iter().map(|core| core.name().to_string()))
            .collect();
        for name in names {
            if let Some(batch) = self.handle_at(&name, Event::Start) {
                self.absorb(batch);
            }
        }
    }

    /// Fires a pending timer without consuming it. Returns whether one was
    /// pending.
    pub fn fire(&mut self, name: &str, kind: &str) -> bool {
        let Some(timer) = self
            .timers
            .iter()
            .find(|t| t.to == name && t.kind == kind)
            .cloned()
        else {
            return false;
        };
        let event = Event::Timeout {
            kind: timer.kind,
            body: timer.body,
        };
        if let Some(batch) = self.handle_at(name, event) {
            self.absorb(batch);
        }
        true
    }

    /// Pops the oldest pending `Command` timer of `name` and fires it,
    /// modeling the dispatcher delivering each queued command once.
    pub fn fire_next_command(&mut self, name: &str) -> bool {
        let Some(position) = self
            .timers
            .iter()
            .position(|t| t.to == name && t.kind == raft_shim::client::COMMAND_TIMER)
        else {
            return false;
        };
        let timer = self.timers.remove(position);
        let event = Event::Timeout {
            kind: timer.kind,
            body: timer.body,
        };
        if let Some(batch) = self.handle_at(name, event) {
            self.absorb(batch);
        }
        true
    }

    /// Delivers queued messages in order until the queue drains.
    pub fn deliver_all(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            self.deliver(message);
        }
    }

    /// Delivers one message unless it crosses the partition boundary.
    pub fn deliver(&mut self, message: OutgoingMessage) {
        if self.partitioned.contains(&message.from) != self.partitioned.contains(&message.to) {
            return;
        }
        let event = Event::Msg {
            from: message.from.clone(),
            kind: message.kind,
            body: message.body,
        };
        if let Some(batch) = self.handle_at(&message.to, event) {
            self.absorb(batch);
        }
    }

    /// Full election for `name`: fire its election timer, deliver traffic.
    pub fn elect(&mut self, name: &str) {
        assert!(self.fire(name, ELECTION_TIMER), "no election timer pending");
        self.deliver_all();
    }

    /// Heartbeat round for the leader: fire its heartbeat, deliver traffic.
    pub fn heartbeat(&mut self, name: &str) {
        assert!(self.fire(name, HEARTBEAT_TIMER), "no heartbeat timer pending");
        self.deliver_all();
    }

    pub fn partition(&mut self, names: &[&str]) {
        self.partitioned = names.iter().map(|s| s.to_string()).collect();
    }

    pub fn heal(&mut self) {
        self.partitioned.clear();
    }

    pub fn server_state(&self, name: &str) -> &ServerState {
        self.servers
            .iter()
            .find(|core| core.name() == name)
            .map(NodeCore::state)
            .unwrap_or_else(|| panic!("no server named {name}"))
    }

    pub fn client_state(&self, name: &str) -> &ClientState {
        self.clients
            .iter()
            .find(|core| core.name() == name)
            .map(NodeCore::state)
            .unwrap_or_else(|| panic!("no client named {name}"))
    }

    /// Cluster membership as `name` derives it from its own log.
    pub fn effective_cluster(&self, name: &str) -> Vec<String> {
        let core = self
            .servers
            .iter()
            .find(|core| core.name() == name)
            .unwrap_or_else(|| panic!("no server named {name}"));
        core.protocol().cluster(core.state())
    }

    pub fn leaders(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|core| core.state().role == Role::Leader)
            .map(|core| core.name().to_string())
            .collect()
    }

    pub fn has_timer(&self, name: &str, kind: &str) -> bool {
        self.timers.iter().any(|t| t.to == name && t.kind == kind)
    }

    /// Every message of `kind` emitted over the whole run so far.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<&OutgoingMessage> {
        self.sent.iter().filter(|m| m.kind == kind).collect()
    }

    fn handle_at(&mut self, name: &str, event: Event) -> Option<EffectBatch> {
        if let Some(core) = self.servers.iter_mut().find(|core| core.name() == name) {
            return core.handle(event).expect("server handler");
        }
        if let Some(core) = self.clients.iter_mut().find(|core| core.name() == name) {
            return core.handle(event).expect("client handler");
        }
        // Messages to unknown nodes just disappear, like on a real network.
        None
    }

    fn absorb(&mut self, batch: EffectBatch) {
        // A clear targets timers requested by earlier batches, so clears
        // apply before this batch's own sets.
        for cleared in batch.cleared_timeouts {
            self.timers
                .retain(|t| !(t.to == cleared.to && t.kind == cleared.kind && t.body == cleared.body));
        }
        for timer in batch.set_timeouts {
            if !self.timers.contains(&timer) {
                self.timers.push(timer);
            }
        }
        self.sent.extend(batch.messages.iter().cloned());
        self.queue.extend(batch.messages);
    }
}
