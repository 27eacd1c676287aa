//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;
use crate::SessionId;

/// A result type where the error is a [`ServerError`].
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced by a server's consensus core.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The server is shutting down or has shut down.
    #[error("the server is shutting down")]
    Shutdown,

    /// A fatal storage error. The server transitions to its terminal state.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An operation was attempted which the server's current state forbids.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An argument to an operation was invalid.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

/// Errors surfaced by the storage layer.
///
/// All storage errors are fatal to the owning server: a server observing one
/// transitions to its terminal state and closes its transport.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk log is corrupt beyond a recoverable torn tail.
    #[error("log corruption in segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },

    /// An entry payload failed to encode or decode.
    #[error("entry codec error at index {index}: {reason}")]
    Codec { index: u64, reason: String },

    /// A caller violated a log invariant, e.g. truncating below the applied
    /// index or moving a watermark backwards.
    #[error("illegal log operation: {0}")]
    IllegalOperation(String),
}

/// Errors returned to clients and to servers acting as clients of the leader.
///
/// The transient variants (`NoLeader`, `ConnectionLost`, `Timeout`) are
/// retriable and handled by the client core's re-routing loop. The session
/// variants are fatal to the session: the client must register a new one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ClientError {
    /// The contacted server is not the leader. Carries the leader hint when
    /// one is known, so the caller can re-route instead of probing blindly.
    #[error("no leader to handle the request (hint: {leader:?})")]
    NoLeader { leader: Option<NodeId> },

    /// The connection to the target server was lost.
    #[error("connection lost")]
    ConnectionLost,

    /// The request did not complete within its budget.
    #[error("request timed out")]
    Timeout,

    /// The addressed session does not exist on this cluster.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The addressed session has expired.
    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    /// The client handle was closed while the request was pending.
    #[error("the client is closed")]
    Closed,

    /// The server is shutting down.
    #[error("the server is shutting down")]
    Shutdown,

    /// The request was malformed or arrived in a state which forbids it.
    #[error("illegal request: {0}")]
    IllegalRequest(String),

    /// An error raised by the application state machine while applying the
    /// operation. Application errors are captured into the result and never
    /// unwind consensus.
    #[error("application error: {0}")]
    Application(String),
}

/// Errors produced while validating a [`Config`](crate::config::Config).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout must be greater than zero")]
    InvalidElectionTimeout,

    #[error("heartbeat interval must be shorter than the election timeout")]
    HeartbeatTooLong,

    #[error("session timeout must exceed the heartbeat interval")]
    SessionTimeoutTooShort,

    #[error("segment capacity must be greater than zero")]
    InvalidSegmentSize,

    #[error("max payload entries must be greater than zero")]
    InvalidMaxPayloadEntries,
}
