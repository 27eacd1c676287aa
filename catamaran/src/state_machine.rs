//! The application state machine contract.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::session::Session;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::SessionId;

/// A committed operation being applied to the state machine.
///
/// A commit exposes the log position and leader clock of its entry, the
/// owning session, and the application operation. Events published through
/// [`Commit::publish`] are sequenced on the session and delivered to its
/// client with at-least-once semantics.
pub struct Commit<'a, D: AppData, R: AppDataResponse, E: AppEvent> {
    pub(crate) index: u64,
    pub(crate) timestamp: u64,
    pub(crate) session: &'a mut Session<D, R, E>,
    pub(crate) operation: &'a D,
}

impl<'a, D: AppData, R: AppDataResponse, E: AppEvent> Commit<'a, D, R, E> {
    /// The log index of the operation.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The leader clock at which the operation was appended, in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The session the operation belongs to.
    pub fn session(&self) -> &Session<D, R, E> {
        self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// The application operation.
    pub fn operation(&self) -> &D {
        self.operation
    }

    /// Publish an event to the owning session, returning its sequence.
    pub fn publish(&mut self, event: E) -> u64 {
        self.session.publish(event)
    }
}

/// A command entry being weighed for retention during compaction.
///
/// Unlike [`Commit`] the session is referenced by id only — the session a
/// filtered entry belonged to may no longer exist.
pub struct FilterCommit<'a, D: AppData> {
    pub index: u64,
    pub timestamp: u64,
    pub session: SessionId,
    pub operation: &'a D,
}

/// Which compaction tier is asking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionKind {
    /// Bounded by the commit index.
    Minor,
    /// Bounded by the global index; tombstones and dedup state may go.
    Major,
}

/// The context of a compaction pass handed to the filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compaction {
    pub kind: CompactionKind,
    /// The watermark of the pass: every entry at or below it is eligible.
    pub index: u64,
}

/// A trait defining the interface of the user's application state machine.
///
/// Committed operations are applied one at a time, in log index order, on a
/// dedicated execution context — implementations never need internal
/// synchronization, and long running `apply` calls never block consensus.
///
/// Errors returned from `apply` are captured and delivered as the command's
/// result; they do not affect the server. Lifecycle hooks are invoked
/// exactly once per session transition.
#[async_trait]
pub trait StateMachine<D, R>: Send + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The type of events this state machine publishes to sessions.
    type Event: AppEvent;

    /// Apply a committed command or query and produce its result.
    async fn apply(&mut self, commit: Commit<'_, D, R, Self::Event>) -> anyhow::Result<R>;

    /// Decide whether a command entry still contributes to the current state
    /// and must survive the given compaction pass. The default keeps
    /// everything.
    async fn filter(&mut self, commit: FilterCommit<'_, D>, compaction: Compaction) -> anyhow::Result<bool> {
        let _ = (commit, compaction);
        Ok(true)
    }

    /// A session was registered.
    async fn session_registered(&mut self, session: &Session<D, R, Self::Event>) {
        let _ = session;
    }

    /// A session expired against the log clock.
    async fn session_expired(&mut self, session: &Session<D, R, Self::Event>) {
        let _ = session;
    }

    /// A session was closed by its client.
    async fn session_closed(&mut self, session: &Session<D, R, Self::Event>) {
        let _ = session;
    }
}
