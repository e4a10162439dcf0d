//! The closed set of message kinds exchanged by Raft servers and clients,
//! plus the replicated log entry format.
//!
//! [`RaftMessage`] is adjacently tagged so that serializing one yields
//! exactly the `type`/`body` pair the wire protocol carries; [`encode`] and
//! [`decode`] do the split and the reassembly at the runtime boundary.
//! Anything that fails to decode is simply not a Raft message and gets
//! dropped by the receiving handler.
//!
//! [`encode`]: RaftMessage::encode
//! [`decode`]: RaftMessage::decode

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Request tag carried by client-originated log entries, used to route the
/// `Applied` acknowledgment once the entry commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requester {
    pub sender: String,
    pub n: u64,
}

/// What a log entry carries besides its term.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    /// Leader no-op appended to establish commitment of prior-term entries.
    Dummy,
    /// An opaque client command.
    Command { command: Value },
    /// A single-server membership change; `cluster` is the full new roster.
    Reconfig { cluster: Vec<String> },
}

/// One replicated log entry. Entries are never mutated after append;
/// conflicting suffixes are replaced wholesale by truncation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub term: i64,
    #[serde(flatten)]
    pub kind: EntryKind,
    #[serde(flatten)]
    pub requester: Option<Requester>,
}

impl LogEntry {
    pub fn dummy(term: i64) -> Self {
        Self {
            term,
            kind: EntryKind::Dummy,
            requester: None,
        }
    }

    pub fn command(term: i64, command: Value, requester: Requester) -> Self {
        Self {
            term,
            kind: EntryKind::Command { command },
            requester: Some(requester),
        }
    }

    pub fn reconfig(term: i64, cluster: Vec<String>, requester: Requester) -> Self {
        Self {
            term,
            kind: EntryKind::Reconfig { cluster },
            requester: Some(requester),
        }
    }
}

/// Every message kind a Raft node sends or accepts.
///
/// Server-to-server kinds carry the sender's term explicitly; `Applied` is
/// the one server-to-client kind and carries none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "body")]
pub enum RaftMessage {
    RequestVote {
        term: i64,
        max_index: i64,
        max_term: i64,
    },
    Vote {
        term: i64,
    },
    AppendEntries {
        term: i64,
        prev_index: i64,
        prev_term: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
    },
    AppendEntriesReply {
        term: i64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_index: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_index: Option<i64>,
    },
    AddNode {
        node: String,
        n: u64,
    },
    RemoveNode {
        node: String,
        n: u64,
    },
    Command {
        command: Value,
        n: u64,
    },
    Applied {
        n: u64,
        cluster: Vec<String>,
    },
}

impl RaftMessage {
    /// Splits the message into the wire's `type` string and `body` object.
    pub fn encode(&self) -> (String, Value) {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut parts)) => {
                let kind = parts
                    .remove("type")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                let body = parts.remove("body").unwrap_or_else(|| json!({}));
                (kind, body)
            }
            _ => (String::new(), Value::Null),
        }
    }

    /// Rebuilds a message from the wire's `type`/`body` pair.
    ///
    /// Unknown kinds and malformed bodies yield `None`; both are dropped by
    /// handlers as normal control flow, never raised as faults.
    pub fn decode(kind: &str, body: Value) -> Option<Self> {
        serde_json::from_value(json!({ "type": kind, "body": body })).ok()
    }
}
