//! An in-memory key/value implementation of the `catamaran::StateMachine`
//! trait, used by the integration test suite.
//!
//! Besides the key/value map itself, `MemApp` records observability counters
//! the tests assert on: how often each key was applied (at-most-once), and
//! which sessions were registered, expired and closed (lifecycle hooks).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use catamaran::session::Session;
use catamaran::state_machine::Commit;
use catamaran::state_machine::Compaction;
use catamaran::state_machine::FilterCommit;
use catamaran::state_machine::StateMachine;
use catamaran::SessionId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The operations the key/value machine understands. Commands and queries
/// share the payload type; `Get` is the read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvRequest {
    Put { key: String, value: String },
    Delete { key: String },
    Get { key: String },
    /// Subscribe the issuing session to change events for its own writes.
    Subscribe,
    /// Fail with an application error; exercises error capture.
    Fail { message: String },
}

/// The result of applying a [`KvRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Done,
    Value(Option<String>),
}

/// A change event published to subscribed sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<String>,
}

/// The observable state of one `MemApp` instance.
#[derive(Default)]
pub struct KvState {
    pub data: BTreeMap<String, String>,
    /// The index of the latest write per key; drives the retention filter.
    pub latest_write: HashMap<String, u64>,
    /// How many times `apply` ran a write for each key. At-most-once means
    /// a retried command never bumps this twice.
    pub apply_counts: HashMap<String, u64>,
    pub registered: Vec<SessionId>,
    pub expired: Vec<SessionId>,
    pub closed: Vec<SessionId>,
    subscribed: HashSet<SessionId>,
}

/// An in-memory key/value state machine.
pub struct MemApp {
    state: Arc<RwLock<KvState>>,
}

impl MemApp {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(KvState::default())),
        }
    }

    /// A handle to the observable state, for test assertions.
    pub fn handle(&self) -> Arc<RwLock<KvState>> {
        self.state.clone()
    }
}

impl Default for MemApp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine<KvRequest, KvResponse> for MemApp {
    type Event = KvEvent;

    async fn apply(&mut self, mut commit: Commit<'_, KvRequest, KvResponse, KvEvent>) -> anyhow::Result<KvResponse> {
        let operation = commit.operation().clone();
        let index = commit.index();
        let session = commit.session_id();
        tracing::debug!(index, session, ?operation, "applying operation");

        match operation {
            KvRequest::Put { key, value } => {
                let subscribed = {
                    let mut state = self.state.write().await;
                    state.data.insert(key.clone(), value.clone());
                    state.latest_write.insert(key.clone(), index);
                    *state.apply_counts.entry(key.clone()).or_insert(0) += 1;
                    state.subscribed.contains(&session)
                };
                if subscribed {
                    commit.publish(KvEvent {
                        key,
                        value: Some(value),
                    });
                }
                Ok(KvResponse::Done)
            }
            KvRequest::Delete { key } => {
                let subscribed = {
                    let mut state = self.state.write().await;
                    state.data.remove(&key);
                    state.latest_write.insert(key.clone(), index);
                    *state.apply_counts.entry(key.clone()).or_insert(0) += 1;
                    state.subscribed.contains(&session)
                };
                if subscribed {
                    commit.publish(KvEvent { key, value: None });
                }
                Ok(KvResponse::Done)
            }
            KvRequest::Get { key } => {
                let state = self.state.read().await;
                Ok(KvResponse::Value(state.data.get(&key).cloned()))
            }
            KvRequest::Subscribe => {
                self.state.write().await.subscribed.insert(session);
                Ok(KvResponse::Done)
            }
            KvRequest::Fail { message } => Err(anyhow!(message)),
        }
    }

    /// Keep only the latest write per key; reads and superseded writes are
    /// dead weight in the log.
    async fn filter(&mut self, commit: FilterCommit<'_, KvRequest>, _compaction: Compaction) -> anyhow::Result<bool> {
        let state = self.state.read().await;
        match commit.operation {
            KvRequest::Put { key, .. } | KvRequest::Delete { key } => {
                Ok(state.latest_write.get(key) == Some(&commit.index))
            }
            KvRequest::Get { key: _ } => Ok(false),
            KvRequest::Subscribe => Ok(true),
            KvRequest::Fail { .. } => Ok(false),
        }
    }

    async fn session_registered(&mut self, session: &Session<KvRequest, KvResponse, KvEvent>) {
        self.state.write().await.registered.push(session.id());
    }

    async fn session_expired(&mut self, session: &Session<KvRequest, KvResponse, KvEvent>) {
        let mut state = self.state.write().await;
        state.expired.push(session.id());
        state.subscribed.remove(&session.id());
    }

    async fn session_closed(&mut self, session: &Session<KvRequest, KvResponse, KvEvent>) {
        let mut state = self.state.write().await;
        state.closed.push(session.id());
        state.subscribed.remove(&session.id());
    }
}
