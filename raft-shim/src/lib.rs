//! Dispatcher-driven protocol nodes with a Raft implementation on top.
//!
//! A node in this crate never owns delivery order, timer firing, or fault
//! injection: it registers with an external dispatcher over one TCP stream,
//! then turns each delivered event into a batch of declared effects —
//! outgoing messages, timer set/clear requests, and its new state — which
//! the dispatcher applies however a test run dictates. That inversion makes
//! whole distributed protocol runs deterministic and replayable.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`wire`] implements the length-prefixed JSON framing and the frame
//!   vocabulary shared with the dispatcher.
//! - [`runtime`] runs the per-node event loop and enforces the
//!   effect-accumulation contract handlers live under.
//! - [`messages`] defines the closed set of Raft message kinds and the
//!   replicated log entry format.
//! - [`server`] is the Raft server: elections, replication, commit, and
//!   single-server reconfiguration.
//! - [`client`] is the Raft client: sequenced command submission with
//!   retransmission.
//! - [`cli`] parses the command-line interface for server and client nodes.
//!
//! Integration tests drive [`runtime::NodeCore`] directly, playing
//! dispatcher themselves to script delivery orders that would be races on a
//! real network.

pub mod cli;
pub mod client;
pub mod messages;
pub mod runtime;
pub mod server;
pub mod wire;
