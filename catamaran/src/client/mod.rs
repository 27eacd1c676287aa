//! The client core: session management, sequenced submission, leader
//! routing and event intake.
//!
//! A client opens one session against the cluster, renews it with
//! keep-alives at half the granted timeout, and submits commands with
//! client-assigned sequences. On leader loss a command is resubmitted with
//! the *same* sequence — the session layer on the servers deduplicates, so
//! a retried command applies at most once.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Duration;
use tracing::Instrument;

use crate::config::Config;
use crate::error::ClientError;
use crate::protocol::CommandRequest;
use crate::protocol::CommandResponse;
use crate::protocol::Consistency;
use crate::protocol::KeepAliveRequest;
use crate::protocol::KeepAliveResponse;
use crate::protocol::PublishRequest;
use crate::protocol::PublishResponse;
use crate::protocol::QueryRequest;
use crate::protocol::QueryResponse;
use crate::protocol::RegisterRequest;
use crate::protocol::RegisterResponse;
use crate::protocol::UnregisterRequest;
use crate::protocol::UnregisterResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::NodeId;
use crate::SessionId;

/// The transport a client uses to reach cluster members.
#[async_trait]
pub trait ClientTransport<D: AppData, R: AppDataResponse>: Send + Sync + 'static {
    async fn register(&self, target: NodeId, rpc: RegisterRequest) -> Result<RegisterResponse, ClientError>;
    async fn keep_alive(&self, target: NodeId, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, ClientError>;
    async fn unregister(&self, target: NodeId, rpc: UnregisterRequest) -> Result<UnregisterResponse, ClientError>;
    async fn command(&self, target: NodeId, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, ClientError>;
    async fn query(&self, target: NodeId, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, ClientError>;
}

struct ClientState {
    /// The servers this client may route to.
    servers: Vec<NodeId>,
    /// The believed leader; probed round-robin when absent or wrong.
    leader: Option<NodeId>,
    session: Option<SessionId>,
    /// The granted session timeout in milliseconds.
    session_timeout: u64,
    /// The sequence assigned to the most recent command.
    next_sequence: u64,
    /// Sequences whose responses have been received.
    responded: BTreeSet<u64>,
    /// The highest contiguous responded sequence; sent in keep-alives to
    /// let servers drop cached responses at or below it.
    acked_sequence: u64,
    /// The highest event sequence received in order.
    event_sequence: u64,
}

struct ClientInner<D, R, E, T>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    T: ClientTransport<D, R>,
{
    transport: Arc<T>,
    connection: u64,
    probe_delay: Duration,
    probe_rounds: u64,
    state: Mutex<ClientState>,
    /// Commands are sequenced strictly one at a time so their log order
    /// matches their sequence order.
    command_gate: Mutex<()>,
    events_tx: mpsc::UnboundedSender<E>,
    keep_alive_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    marker: std::marker::PhantomData<fn() -> (D, R)>,
}

/// A catamaran client.
///
/// Cheap to clone; all clones share the session.
pub struct Client<D, R, E, T>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    T: ClientTransport<D, R>,
{
    inner: Arc<ClientInner<D, R, E, T>>,
}

impl<D, R, E, T> Clone for Client<D, R, E, T>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    T: ClientTransport<D, R>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, R, E, T> Client<D, R, E, T>
where
    D: AppData,
    R: AppDataResponse,
    E: AppEvent,
    T: ClientTransport<D, R>,
{
    /// Create a new client over the given servers. Events pushed by the
    /// cluster arrive, deduplicated and in order, on the returned receiver.
    pub fn new(config: Arc<Config>, transport: Arc<T>, servers: Vec<NodeId>) -> (Self, mpsc::UnboundedReceiver<E>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = ClientInner {
            transport,
            connection: rand::random::<u64>(),
            probe_delay: Duration::from_millis(config.probe_delay),
            probe_rounds: config.probe_rounds,
            state: Mutex::new(ClientState {
                servers,
                leader: None,
                session: None,
                session_timeout: config.session_timeout,
                next_sequence: 0,
                responded: BTreeSet::new(),
                acked_sequence: 0,
                event_sequence: 0,
            }),
            command_gate: Mutex::new(()),
            events_tx,
            keep_alive_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            marker: std::marker::PhantomData,
        };
        (
            Self { inner: Arc::new(inner) },
            events_rx,
        )
    }

    /// The connection id this client registers sessions under.
    pub fn connection(&self) -> u64 {
        self.inner.connection
    }

    /// The current session id, if one is open.
    pub async fn session(&self) -> Option<SessionId> {
        self.inner.state.lock().await.session
    }

    /// Open a session and start the keep-alive loop.
    #[tracing::instrument(level = "debug", skip(self), fields(connection=self.inner.connection))]
    pub async fn register(&self) -> Result<SessionId, ClientError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let connection = self.inner.connection;
        let transport = self.inner.transport.clone();
        let res = self
            .route(move |target| {
                let transport = transport.clone();
                async move {
                    transport
                        .register(target, RegisterRequest {
                            connection,
                            timeout: 0,
                        })
                        .await
                }
            })
            .await?;

        {
            let mut state = self.inner.state.lock().await;
            state.session = Some(res.session);
            state.session_timeout = res.timeout;
            state.leader = Some(res.leader);
            state.servers = res.members.iter().map(|m| m.id).collect();
        }
        tracing::info!(session = res.session, leader = res.leader, "session registered");
        self.start_keep_alive(res.timeout).await;
        Ok(res.session)
    }

    /// Submit a command. On routing failures the command is resubmitted
    /// with the same sequence; the cluster applies it at most once.
    #[tracing::instrument(level = "debug", skip(self, operation))]
    pub async fn submit(&self, operation: D) -> Result<R, ClientError> {
        let _gate = self.inner.command_gate.lock().await;
        let (session, sequence) = {
            let mut state = self.inner.state.lock().await;
            let session = state.session.ok_or(ClientError::IllegalRequest("no open session".into()))?;
            state.next_sequence += 1;
            (session, state.next_sequence)
        };

        let transport = self.inner.transport.clone();
        let res = self
            .route(move |target| {
                let transport = transport.clone();
                let operation = operation.clone();
                async move {
                    transport
                        .command(target, CommandRequest {
                            session,
                            sequence,
                            operation,
                        })
                        .await
                }
            })
            .await;

        match res {
            Ok(res) => {
                let mut state = self.inner.state.lock().await;
                state.responded.insert(sequence);
                loop {
                    let next = state.acked_sequence + 1;
                    if !state.responded.remove(&next) {
                        break;
                    }
                    state.acked_sequence += 1;
                }
                Ok(res.result)
            }
            Err(err) => {
                self.fail_session_on(&err).await;
                Err(err)
            }
        }
    }

    /// Submit a query. The query carries the session's current command
    /// sequence, so it observes every command this client already issued.
    #[tracing::instrument(level = "debug", skip(self, operation))]
    pub async fn query(&self, operation: D, consistency: Consistency) -> Result<R, ClientError> {
        let (session, sequence) = {
            let state = self.inner.state.lock().await;
            let session = state.session.ok_or(ClientError::IllegalRequest("no open session".into()))?;
            (session, state.next_sequence)
        };

        let transport = self.inner.transport.clone();
        let res = self
            .route(move |target| {
                let transport = transport.clone();
                let operation = operation.clone();
                async move {
                    transport
                        .query(target, QueryRequest {
                            session,
                            sequence,
                            operation,
                            consistency,
                        })
                        .await
                }
            })
            .await;

        match res {
            Ok(res) => Ok(res.result),
            Err(err) => {
                self.fail_session_on(&err).await;
                Err(err)
            }
        }
    }

    /// Handle an incoming event push from the cluster, answering with the
    /// highest event sequence received in order. Duplicates are dropped; a
    /// gap leaves the ack behind, which makes the server resend.
    pub async fn handle_publish(&self, rpc: PublishRequest<E>) -> PublishResponse {
        let mut state = self.inner.state.lock().await;
        if rpc.sequence == state.event_sequence + 1 {
            state.event_sequence = rpc.sequence;
            let _ = self.inner.events_tx.send(rpc.event);
        } else if rpc.sequence > state.event_sequence + 1 {
            tracing::debug!(
                got = rpc.sequence,
                expected = state.event_sequence + 1,
                "event gap detected; requesting resend"
            );
        }
        PublishResponse {
            ack: state.event_sequence,
        }
    }

    /// Close the session and stop the keep-alive loop. Pending requests
    /// fail with [`ClientError::Closed`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = self.inner.keep_alive_task.lock().await.take() {
            task.abort();
        }

        let session = self.inner.state.lock().await.session.take();
        if let Some(session) = session {
            let transport = self.inner.transport.clone();
            // Best effort: the session expires by itself if this misses.
            let res = self
                .route(move |target| {
                    let transport = transport.clone();
                    async move { transport.unregister(target, UnregisterRequest { session }).await }
                })
                .await;
            if let Err(err) = res {
                tracing::debug!(error=%err, "unregister on close failed; session will expire");
            }
        }
        Ok(())
    }

    /// Route a request to the cluster: try the believed leader, follow
    /// redirects, and probe the servers round-robin on transient failures.
    async fn route<F, Fut, O>(&self, f: F) -> Result<O, ClientError>
    where
        F: Fn(NodeId) -> Fut,
        Fut: Future<Output = Result<O, ClientError>>,
    {
        let mut cursor = 0usize;
        for round in 0..self.inner.probe_rounds {
            if self.inner.closed.load(Ordering::Acquire) && round > 0 {
                return Err(ClientError::Closed);
            }

            let target = {
                let state = self.inner.state.lock().await;
                if state.servers.is_empty() {
                    return Err(ClientError::IllegalRequest("client has no servers configured".into()));
                }
                match state.leader {
                    Some(leader) => leader,
                    None => {
                        let target = state.servers[cursor % state.servers.len()];
                        cursor += 1;
                        target
                    }
                }
            };

            match f(target).await {
                Ok(res) => {
                    self.inner.state.lock().await.leader = Some(target);
                    return Ok(res);
                }
                Err(ClientError::NoLeader { leader }) => {
                    tracing::debug!(target, hint = ?leader, "request redirected");
                    let mut state = self.inner.state.lock().await;
                    state.leader = leader.filter(|hint| *hint != target);
                }
                Err(ClientError::ConnectionLost) | Err(ClientError::Timeout) | Err(ClientError::Shutdown) => {
                    tracing::debug!(target, "server unreachable; probing on");
                    self.inner.state.lock().await.leader = None;
                }
                Err(err) => return Err(err),
            }
            sleep(self.inner.probe_delay).await;
        }
        Err(ClientError::Timeout)
    }

    /// Drop the session on fatal session errors so callers re-register.
    async fn fail_session_on(&self, err: &ClientError) {
        if matches!(err, ClientError::UnknownSession(_) | ClientError::SessionExpired(_)) {
            tracing::warn!(error=%err, "session is gone; a new registration is required");
            self.inner.state.lock().await.session = None;
        }
    }

    /// Start the keep-alive ticker at half the granted session timeout.
    async fn start_keep_alive(&self, session_timeout: u64) {
        let inner = self.inner.clone();
        let period = Duration::from_millis((session_timeout / 2).max(1));
        let task = tokio::spawn(
            async move {
                let mut cursor = 0usize;
                loop {
                    sleep(period).await;
                    if inner.closed.load(Ordering::Acquire) {
                        return;
                    }
                    let (session, command_sequence, event_sequence, target) = {
                        let state = inner.state.lock().await;
                        let session = match state.session {
                            Some(session) => session,
                            None => return,
                        };
                        // Probe round-robin while the leader is unknown.
                        let target = state.leader.or_else(|| {
                            if state.servers.is_empty() {
                                None
                            } else {
                                cursor += 1;
                                Some(state.servers[(cursor - 1) % state.servers.len()])
                            }
                        });
                        (session, state.acked_sequence, state.event_sequence, target)
                    };
                    let target = match target {
                        Some(target) => target,
                        None => continue,
                    };

                    let rpc = KeepAliveRequest {
                        session,
                        command_sequence,
                        event_sequence,
                    };
                    match inner.transport.keep_alive(target, rpc).await {
                        Ok(res) => {
                            let mut state = inner.state.lock().await;
                            state.leader = Some(res.leader);
                            state.servers = res.members.iter().map(|m| m.id).collect();
                        }
                        Err(ClientError::NoLeader { leader }) => {
                            inner.state.lock().await.leader = leader;
                        }
                        Err(ClientError::SessionExpired(_)) | Err(ClientError::UnknownSession(_)) => {
                            tracing::warn!(session, "keep-alive lost the session");
                            inner.state.lock().await.session = None;
                            return;
                        }
                        Err(err) => {
                            tracing::debug!(error=%err, "keep-alive failed; probing next round");
                            inner.state.lock().await.leader = None;
                        }
                    }
                }
            }
            .instrument(tracing::debug_span!("keep-alive")),
        );
        if let Some(old) = self.inner.keep_alive_task.lock().await.replace(task) {
            old.abort();
        }
    }
}
