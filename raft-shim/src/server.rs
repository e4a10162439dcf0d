//! Raft server: leader election, log replication, majority commit, and
//! single-server cluster reconfiguration.
//!
//! The whole state machine is expressed through the runtime's effect
//! contract — handlers mutate [`ServerState`] and declare messages and timer
//! operations on [`Effects`], and never touch a socket. The election and
//! heartbeat timers are named timers owned by the dispatcher; the server
//! re-arms only the election timer (on every term increase) and leaves
//! repeat firing of the rest to the dispatcher.
//!
//! Cluster membership is a pure function of the log: the most recent
//! `reconfig` entry wins, committed or not, falling back to the node's
//! initial configuration. Replication targets and commit quorums both read
//! membership through [`RaftServer::cluster`], so they can never disagree
//! about who counts.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::messages::{EntryKind, LogEntry, RaftMessage, Requester};
use crate::runtime::{Effects, Protocol};

pub const ELECTION_TIMER: &str = "Election";
pub const HEARTBEAT_TIMER: &str = "Heartbeat";

/// Raft roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

/// Everything a Raft server keeps between events.
///
/// Serialized verbatim into the per-node state snapshot of every effect
/// batch, which is how the dispatcher observes elections and commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub role: Role,
    pub term: i64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
    pub commit_index: i64,
    /// Voters heard from this term; meaningful only while a Candidate.
    pub votes: BTreeSet<String>,
    /// Per-follower replication cursors; meaningful only while Leader.
    pub next_index: BTreeMap<String, i64>,
    pub match_index: BTreeMap<String, i64>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            term: -1,
            voted_for: None,
            log: Vec::new(),
            commit_index: -1,
            votes: BTreeSet::new(),
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
        }
    }
}

impl ServerState {
    /// Index of the last log entry, `-1` when the log is empty.
    pub fn max_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    /// Term of the last log entry, `-1` when the log is empty.
    pub fn max_term(&self) -> i64 {
        self.log.last().map_or(-1, |entry| entry.term)
    }

    fn entry_term(&self, index: i64) -> i64 {
        if index < 0 {
            return -1;
        }
        self.log.get(index as usize).map_or(-1, |entry| entry.term)
    }
}

/// The Raft server protocol.
pub struct RaftServer {
    initial_cluster: Vec<String>,
}

impl RaftServer {
    /// `initial_cluster` applies until the log carries a reconfig entry.
    pub fn new(initial_cluster: Vec<String>) -> Self {
        Self { initial_cluster }
    }

    /// Effective cluster membership derived from the log.
    pub fn cluster(&self, state: &ServerState) -> Vec<String> {
        for entry in state.log.iter().rev() {
            if let EntryKind::Reconfig { cluster } = &entry.kind {
                return cluster.clone();
            }
        }
        self.initial_cluster.clone()
    }

    /// A reconfiguration is in flight while a reconfig entry sits above the
    /// commit index. Two proposals landing in the same handling window can
    /// still race past this check; that window is accepted, not fixed.
    fn currently_reconfiguring(&self, state: &ServerState) -> bool {
        state
            .log
            .iter()
            .rposition(|entry| matches!(entry.kind, EntryKind::Reconfig { .. }))
            .is_some_and(|index| index as i64 > state.commit_index)
    }

    fn send(&self, fx: &mut Effects, to: &str, message: &RaftMessage) {
        let (kind, body) = message.encode();
        fx.send(to, &kind, body);
    }

    fn broadcast(&self, name: &str, state: &ServerState, fx: &mut Effects, message: &RaftMessage) {
        for peer in self.cluster(state) {
            if peer != name {
                self.send(fx, &peer, message);
            }
        }
    }

    /// Sends `AppendEntries` to `targets`, or to every other cluster member
    /// when `targets` is `None`. Each follower is addressed from its own
    /// replication cursor, so one lagging follower never slows the rest.
    fn replicate_log(
        &self,
        name: &str,
        state: &ServerState,
        fx: &mut Effects,
        targets: Option<&[String]>,
    ) {
        let peers: Vec<String> = match targets {
            Some(targets) => targets.to_vec(),
            None => self
                .cluster(state)
                .into_iter()
                .filter(|peer| peer != name)
                .collect(),
        };

        for peer in peers {
            let next = state
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or_else(|| state.max_index());
            let prev_index = next - 1;
            let entries = state
                .log
                .get(next.max(0) as usize..)
                .unwrap_or_default()
                .to_vec();
            self.send(
                fx,
                &peer,
                &RaftMessage::AppendEntries {
                    term: state.term,
                    prev_index,
                    prev_term: state.entry_term(prev_index),
                    entries,
                    commit_index: state.commit_index,
                },
            );
        }
    }

    /// Adopt a higher term: forget the vote, fall back to Follower, restart
    /// the election timer.
    fn step_down(&self, state: &mut ServerState, term: i64, fx: &mut Effects) {
        state.voted_for = None;
        state.role = Role::Follower;
        fx.clear_timeout(HEARTBEAT_TIMER, json!({}));
        fx.clear_timeout(ELECTION_TIMER, json!({}));
        fx.set_timeout(ELECTION_TIMER, json!({}));
        state.term = term;
    }

    /// A committed entry tagged with a requester acknowledges back to it,
    /// reporting the cluster effective at apply time.
    fn apply_entry(&self, state: &ServerState, fx: &mut Effects, entry: &LogEntry) {
        if let Some(requester) = &entry.requester {
            let message = RaftMessage::Applied {
                n: requester.n,
                cluster: self.cluster(state),
            };
            self.send(fx, &requester.sender, &message);
        }
    }

    fn handle_request_vote(
        &self,
        name: &str,
        from: &str,
        candidate_term: i64,
        candidate_max_index: i64,
        candidate_max_term: i64,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        let max_index = state.max_index();
        let max_term = state.max_term();
        if candidate_term > state.term {
            self.step_down(state, candidate_term, fx);
        }

        let log_up_to_date = max_term < candidate_max_term
            || (max_term == candidate_max_term && max_index <= candidate_max_index);
        let vote_available = state
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == from);

        if state.term <= candidate_term && log_up_to_date && vote_available {
            state.voted_for = Some(from.to_string());
            debug!(name, candidate = from, term = state.term, "granting vote");
            self.send(fx, from, &RaftMessage::Vote { term: state.term });
        }
    }

    fn handle_vote(
        &self,
        name: &str,
        from: &str,
        term: i64,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        if state.role != Role::Candidate || term != state.term {
            return;
        }
        state.votes.insert(from.to_string());

        let cluster = self.cluster(state);
        if state.votes.len() > cluster.len() / 2 {
            info!(name, term = state.term, "won election, becoming leader");
            state.role = Role::Leader;
            fx.clear_timeout(ELECTION_TIMER, json!({}));
            fx.set_timeout(HEARTBEAT_TIMER, json!({}));
            state.match_index = BTreeMap::from([(name.to_string(), state.max_index())]);
            state.next_index = BTreeMap::new();
        }
    }

    fn handle_append_entries(
        &self,
        name: &str,
        from: &str,
        leader_term: i64,
        prev_index: i64,
        prev_term: i64,
        entries: Vec<LogEntry>,
        leader_commit: i64,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        if leader_term < state.term {
            return;
        }
        if leader_term > state.term {
            self.step_down(state, leader_term, fx);
        }

        let log_matches = prev_index <= state.max_index()
            && (prev_index == -1 || state.entry_term(prev_index) == prev_term);
        if !log_matches {
            self.send(
                fx,
                from,
                &RaftMessage::AppendEntriesReply {
                    term: state.term,
                    ok: false,
                    max_index: None,
                    next_index: Some(prev_index),
                },
            );
            return;
        }

        debug!(name, appended = entries.len(), "accepting entries from leader");
        state.log.truncate((prev_index + 1).max(0) as usize);
        state.log.extend(entries);

        let new_commit = leader_commit.min(state.max_index());
        if new_commit > state.commit_index {
            for index in (state.commit_index + 1)..=new_commit {
                let entry = state.log[index as usize].clone();
                self.apply_entry(state, fx, &entry);
            }
            state.commit_index = new_commit;
        }

        self.send(
            fx,
            from,
            &RaftMessage::AppendEntriesReply {
                term: state.term,
                ok: true,
                max_index: Some(state.max_index()),
                next_index: None,
            },
        );
    }

    fn handle_append_entries_reply(
        &self,
        name: &str,
        from: &str,
        term: i64,
        ok: bool,
        max_index: Option<i64>,
        next_index: Option<i64>,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        if state.role != Role::Leader || term != state.term {
            return;
        }

        if !ok {
            if let Some(hint) = next_index {
                state.next_index.insert(from.to_string(), hint);
                self.replicate_log(name, state, fx, Some(&[from.to_string()]));
            }
            return;
        }

        let Some(reported) = max_index else { return };
        state.match_index.insert(from.to_string(), reported);
        state.match_index.insert(name.to_string(), state.max_index());

        // Advance the commit index to the highest entry held by a strict
        // majority of the effective cluster, applying as we go.
        for index in (state.commit_index + 1)..=reported.min(state.max_index()) {
            let cluster = self.cluster(state);
            let acks = cluster
                .iter()
                .filter(|node| {
                    state
                        .match_index
                        .get(node.as_str())
                        .copied()
                        .unwrap_or(-1)
                        >= index
                })
                .count();
            if acks > cluster.len() / 2 {
                let entry = state.log[index as usize].clone();
                self.apply_entry(state, fx, &entry);
                state.commit_index = index;
                debug!(name, index, "entry committed");
            }
        }
    }

    /// AddNode and RemoveNode share everything but the membership edit.
    fn handle_reconfig(
        &self,
        name: &str,
        from: &str,
        node: String,
        n: u64,
        add: bool,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        if state.role != Role::Leader {
            return;
        }
        if self.currently_reconfiguring(state) {
            debug!(name, node, "reconfiguration in flight, dropping request");
            return;
        }

        let mut cluster = self.cluster(state);
        if add {
            if cluster.contains(&node) {
                return;
            }
            cluster.push(node);
        } else {
            if !cluster.contains(&node) {
                return;
            }
            cluster.retain(|member| member != &node);
        }

        info!(name, ?cluster, "appending reconfig entry");
        state.log.push(LogEntry::reconfig(
            state.term,
            cluster,
            Requester {
                sender: from.to_string(),
                n,
            },
        ));
        self.replicate_log(name, state, fx, None);
    }

    fn handle_command(
        &self,
        name: &str,
        from: &str,
        command: Value,
        n: u64,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        if state.role != Role::Leader {
            return;
        }
        state.log.push(LogEntry::command(
            state.term,
            command,
            Requester {
                sender: from.to_string(),
                n,
            },
        ));
        self.replicate_log(name, state, fx, None);
    }
}

impl Protocol for RaftServer {
    type State = ServerState;

    fn on_start(&mut self, name: &str, _state: &mut ServerState, fx: &mut Effects) {
        debug!(name, "server starting as follower");
        fx.set_timeout(ELECTION_TIMER, json!({}));
    }

    fn on_message(
        &mut self,
        to: &str,
        from: &str,
        kind: &str,
        body: Value,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        let Some(message) = RaftMessage::decode(kind, body) else {
            debug!(name = to, from, kind, "dropping unrecognized message");
            return;
        };

        match message {
            RaftMessage::RequestVote {
                term,
                max_index,
                max_term,
            } => self.handle_request_vote(to, from, term, max_index, max_term, state, fx),
            RaftMessage::Vote { term } => self.handle_vote(to, from, term, state, fx),
            RaftMessage::AppendEntries {
                term,
                prev_index,
                prev_term,
                entries,
                commit_index,
            } => self.handle_append_entries(
                to, from, term, prev_index, prev_term, entries, commit_index, state, fx,
            ),
            RaftMessage::AppendEntriesReply {
                term,
                ok,
                max_index,
                next_index,
            } => self.handle_append_entries_reply(
                to, from, term, ok, max_index, next_index, state, fx,
            ),
            RaftMessage::AddNode { node, n } => {
                self.handle_reconfig(to, from, node, n, true, state, fx)
            }
            RaftMessage::RemoveNode { node, n } => {
                self.handle_reconfig(to, from, node, n, false, state, fx)
            }
            RaftMessage::Command { command, n } => {
                self.handle_command(to, from, command, n, state, fx)
            }
            // Applied acknowledgments are client-bound; a server ignores them.
            RaftMessage::Applied { .. } => {}
        }
    }

    fn on_timeout(
        &mut self,
        name: &str,
        kind: &str,
        _body: Value,
        state: &mut ServerState,
        fx: &mut Effects,
    ) {
        match kind {
            ELECTION_TIMER => {
                state.role = Role::Candidate;
                state.term += 1;
                state.votes = BTreeSet::from([name.to_string()]);
                state.voted_for = Some(name.to_string());
                fx.set_timeout(ELECTION_TIMER, json!({}));
                info!(name, term = state.term, "election timeout, requesting votes");
                let message = RaftMessage::RequestVote {
                    term: state.term,
                    max_index: state.max_index(),
                    max_term: state.max_term(),
                };
                self.broadcast(name, state, fx, &message);
            }
            HEARTBEAT_TIMER => {
                if state.role != Role::Leader {
                    return;
                }
                // No entry committed in this term yet: append a dummy so the
                // standard commitment rule can reach prior-term entries.
                if state.term != state.max_term() {
                    state.log.push(LogEntry::dummy(state.term));
                }
                self.replicate_log(name, state, fx, None);
            }
            _ => debug!(name, kind, "ignoring unknown timeout"),
        }
    }
}
