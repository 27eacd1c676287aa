//! RPC request and response types.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::entry::Entry;
use crate::membership::Member;
use crate::AppData;
use crate::AppEvent;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::SessionId;

//////////////////////////////////////////////////////////////////////////////////////////////////
// Replication

/// An RPC sent by the cluster leader to replicate log entries to an active
/// member (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader: NodeId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new log entries to store. May be empty for heartbeats; entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Arc<Entry<D>>>,
    /// The leader's commit index.
    pub commit_index: u64,
    /// The highest index replicated to *all* active members; the safe
    /// watermark for major compaction.
    pub global_index: u64,
}

impl<D: AppData> MessageSummary for AppendRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev_log_id={}, commit={}, global={}, n={}",
            self.term,
            self.leader,
            self.prev_log_id,
            self.commit_index,
            self.global_index,
            self.entries.len()
        )
    }
}

/// The response to an `AppendRequest` or a `SyncRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// True if the receiver contained an entry matching `prev_log_id`.
    pub success: bool,
    /// On failure, the most recent log id which does not conflict with the
    /// request: the leader resumes replication just past it.
    pub conflict: Option<LogId>,
}

/// The relaxed replication RPC sent to passive members.
///
/// Identical in shape to [`AppendRequest`]; passive receivers apply the same
/// consistency check but never vote, and their acknowledgements are not
/// counted toward commitment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest<D: AppData> {
    pub term: u64,
    pub leader: NodeId,
    pub prev_log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Arc<Entry<D>>>,
    pub commit_index: u64,
    pub global_index: u64,
}

impl<D: AppData> MessageSummary for SyncRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev_log_id={}, commit={}, global={}, n={}",
            self.term,
            self.leader,
            self.prev_log_id,
            self.commit_index,
            self.global_index,
            self.entries.len()
        )
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Elections

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate: NodeId,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// A pre-vote probe. Evaluated under the same rules as a `VoteRequest` but
/// grants are not persisted and do not bind the responder's vote.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl MessageSummary for PollRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `PollRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub term: u64,
    pub accepted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Sessions

/// A client request to open a new session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The client chosen connection id used for event delivery.
    pub connection: u64,
    /// The requested session timeout in milliseconds; zero for the cluster
    /// default. The granted timeout is returned in the response.
    pub timeout: u64,
}

/// The response to a `RegisterRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The created session's id.
    pub session: SessionId,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
    /// The responding leader.
    pub leader: NodeId,
    /// The cluster members a client may route requests to.
    pub members: Vec<Member>,
}

/// A client request to renew its session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Acknowledges command responses up to and including this sequence.
    pub command_sequence: u64,
    /// Acknowledges received events up to and including this sequence.
    pub event_sequence: u64,
}

/// The response to a `KeepAliveRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub leader: NodeId,
    pub members: Vec<Member>,
}

/// A client request to close its session cleanly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session: SessionId,
}

/// The response to an `UnregisterRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub leader: NodeId,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Operations

/// A sessioned, sequenced, mutating application operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest<D: AppData> {
    pub session: SessionId,
    pub sequence: u64,
    #[serde(bound = "D: AppData")]
    pub operation: D,
}

impl<D: AppData> MessageSummary for CommandRequest<D> {
    fn summary(&self) -> String {
        format!("session={}, seq={}", self.session, self.sequence)
    }
}

/// The response to a `CommandRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse<R> {
    /// The log index at which the command was recorded.
    pub index: u64,
    pub result: R,
}

/// The consistency level of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// The query is recorded in the log and executed at its own index.
    Linearizable,
    /// The query executes against the leader's applied state without
    /// touching the log. Still ordered after the session's own commands.
    Sequential,
}

/// A sessioned read operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    pub session: SessionId,
    /// The session's current command sequence: the query will not execute
    /// before the command with this sequence has been applied.
    pub sequence: u64,
    #[serde(bound = "D: AppData")]
    pub operation: D,
    pub consistency: Consistency,
}

impl<D: AppData> MessageSummary for QueryRequest<D> {
    fn summary(&self) -> String {
        format!("session={}, seq={}, consistency={:?}", self.session, self.sequence, self.consistency)
    }
}

/// The response to a `QueryRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse<R> {
    /// The log index the query executed at.
    pub index: u64,
    pub result: R,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Reconfiguration

/// A server's request to be added to the cluster (as a passive member).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

/// A server's request to be removed from the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member: Member,
}

/// A request to move a passive member into the active (voting) set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoteRequest {
    pub member: Member,
}

/// A request to move an active member into the passive set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemoteRequest {
    pub member: Member,
}

/// The response to any reconfiguration request, carrying the configuration
/// which resulted from (or already satisfied) the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    /// The index of the Configuration entry establishing this view.
    pub version: u64,
    pub active: Vec<Member>,
    pub passive: Vec<Member>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Events

/// A server-to-client push of one session event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishRequest<E: AppEvent> {
    pub session: SessionId,
    /// The event's sequence within its session.
    pub sequence: u64,
    #[serde(bound = "E: AppEvent")]
    pub event: E,
}

impl<E: AppEvent> MessageSummary for PublishRequest<E> {
    fn summary(&self) -> String {
        format!("session={}, seq={}", self.session, self.sequence)
    }
}

/// The response to a `PublishRequest`: the highest event sequence the client
/// has received in order. An `ack` below the pushed sequence asks the server
/// to resend everything after `ack`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub ack: u64,
}
