//! Catamaran is a Raft-based replicated state machine framework.
//!
//! A cluster of servers maintains a strongly-consistent replicated log and
//! applies committed entries, in index order, to a user supplied
//! [`StateMachine`](crate::state_machine::StateMachine). On top of plain
//! consensus the framework provides client *sessions* (at-most-once command
//! semantics, sequenced server-push events, deterministic time) and an
//! incremental two-tier log compaction scheme which replaces snapshotting.
//!
//! The building blocks an application provides are intentionally narrow:
//! a [`Transport`](crate::network::Transport) for server-to-server RPCs, an
//! [`EventTransport`](crate::network::EventTransport) for pushing session
//! events to clients, and the state machine itself. Everything else — the
//! role state machine, the segmented log, the session table, membership
//! reconfiguration and the client core — lives in this crate.

pub mod client;
pub mod config;
mod core;
pub mod entry;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod protocol;
mod quorum;
mod replication;
pub mod server;
pub mod session;
pub mod state_machine;
pub mod storage;

use std::fmt;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::client::Client;
pub use crate::client::ClientTransport;
pub use crate::config::Config;
pub use crate::core::State;
pub use crate::entry::Entry;
pub use crate::entry::EntryPayload;
pub use crate::error::ClientError;
pub use crate::error::ServerError;
pub use crate::error::StorageError;
pub use crate::membership::Member;
pub use crate::membership::MemberKind;
pub use crate::membership::Membership;
pub use crate::metrics::ServerMetrics;
pub use crate::network::EventTransport;
pub use crate::network::Transport;
pub use crate::server::Server;
pub use crate::server::ServerOptions;
pub use crate::state_machine::Commit;
pub use crate::state_machine::Compaction;
pub use crate::state_machine::StateMachine;

/// A Raft node's ID.
pub type NodeId = u64;

/// A session's ID: the index of the Register entry which created it.
pub type SessionId = u64;

/// The identity of a log entry: the term in which it was proposed, and its
/// position in the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait defining application specific operation payloads.
///
/// The intention of this trait is that applications which use this crate
/// define their operations (commands and queries) as a serializable type and
/// let the framework carry them through the log and over the wire opaquely.
/// A blanket impl is provided for any type which satisfies the bounds.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific operation results.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific session event payloads.
///
/// Events are published by the state machine to a session during `apply` and
/// pushed to the owning client with at-least-once delivery in sequence order.
pub trait AppEvent: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppEvent for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait to compress a message into a short loggable string.
pub trait MessageSummary {
    /// Build a short summary of the message for logging.
    fn summary(&self) -> String;
}

/// An ordinary update or a signal to leave a value as it is.
pub enum Update<T> {
    Update(T),
    Ignore,
}
