//! Observability of a running server.
//!
//! A server publishes a [`ServerMetrics`] snapshot on a `watch` channel on
//! every observable change. [`Wait`] turns that channel into awaitable
//! conditions, which the test suite leans on heavily.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::State;
use crate::membership::MemberStatus;
use crate::membership::Membership;
use crate::LogId;
use crate::NodeId;

/// A set of metrics describing the current state of a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    /// The ID of the server.
    pub id: NodeId,
    /// The server's current role.
    pub state: State,
    /// The current term.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The index of the highest committed entry.
    pub commit_index: u64,
    /// The index replicated to every active member.
    pub global_index: u64,
    /// The index of the highest entry applied to the state machine.
    pub last_applied: u64,
    /// The current cluster leader, when known.
    pub current_leader: Option<NodeId>,
    /// The current membership view.
    pub membership: Membership,
    /// Leader-only replication detail.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl ServerMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Joining,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            global_index: 0,
            last_applied: 0,
            current_leader: None,
            membership: Membership::default(),
            leader_metrics: None,
        }
    }
}

/// Per-peer replication state as observed by the leader.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

/// The replication state of a single peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    /// The last log id known to be replicated on the peer.
    pub matched: LogId,
    /// Whether the peer has been answering replication RPCs.
    pub status: MemberStatus,
}

/// An error which may arise while waiting for a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("server is shut down when {0}")]
    Shutdown(String),
}

/// A handle for awaiting metrics conditions.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ServerMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<ServerMetrics, WaitError>
    where T: Fn(&ServerMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait satisfied: {}", msg.to_string());
                return Ok(latest);
            }

            let delay = tokio::time::sleep_until(timeout_at);
            tokio::select! {
                _ = delay => {
                    tracing::debug!("wait timeout: {}", msg.to_string());
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::Shutdown(msg.to_string()));
                    }
                }
            }
        }
    }

    /// Wait for `last_applied` to reach `want` (inclusive).
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= want,
            format!("{} last_applied >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the log to reach `want` entries, received and applied.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want && m.last_applied >= want,
            format!("{} log >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the server to enter the given role.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.state == want,
            format!("{} state -> {:?}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the server to observe the given leader.
    pub async fn current_leader(&self, leader: NodeId, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} leader -> {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the membership version to reach `want`.
    pub async fn membership_version(&self, want: u64, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.membership.version >= want,
            format!("{} membership version >= {}", msg.to_string(), want),
        )
        .await
    }
}
