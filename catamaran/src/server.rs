//! The public server interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::apply::Applier;
use crate::core::CoreOptions;
use crate::core::ServerCore;
use crate::error::ClientError;
use crate::error::ServerError;
use crate::error::ServerResult;
use crate::membership::MemberKind;
use crate::membership::Membership;
use crate::metrics::ServerMetrics;
use crate::metrics::Wait;
use crate::network::EventTransport;
use crate::network::Transport;
use crate::protocol::AppendRequest;
use crate::protocol::AppendResponse;
use crate::protocol::CommandRequest;
use crate::protocol::CommandResponse;
use crate::protocol::ConfigurationResponse;
use crate::protocol::DemoteRequest;
use crate::protocol::JoinRequest;
use crate::protocol::KeepAliveRequest;
use crate::protocol::KeepAliveResponse;
use crate::protocol::LeaveRequest;
use crate::protocol::PollRequest;
use crate::protocol::PollResponse;
use crate::protocol::PromoteRequest;
use crate::protocol::QueryRequest;
use crate::protocol::QueryResponse;
use crate::protocol::RegisterRequest;
use crate::protocol::RegisterResponse;
use crate::protocol::SyncRequest;
use crate::protocol::UnregisterRequest;
use crate::protocol::UnregisterResponse;
use crate::protocol::VoteRequest;
use crate::protocol::VoteResponse;
use crate::state_machine::StateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;

pub(crate) type RegisterTx = oneshot::Sender<Result<RegisterResponse, ClientError>>;
pub(crate) type KeepAliveTx = oneshot::Sender<Result<KeepAliveResponse, ClientError>>;
pub(crate) type UnregisterTx = oneshot::Sender<Result<UnregisterResponse, ClientError>>;
pub(crate) type CommandTx<R> = oneshot::Sender<Result<CommandResponse<R>, ClientError>>;
pub(crate) type QueryTx<R> = oneshot::Sender<Result<QueryResponse<R>, ClientError>>;
pub(crate) type ConfigTx = oneshot::Sender<Result<ConfigurationResponse, ClientError>>;
pub(crate) type LeaveTx = oneshot::Sender<Result<(), ClientError>>;

/// A message coming from the server API into the core.
pub(crate) enum ServerMsg<D: AppData, R: AppDataResponse> {
    Append {
        rpc: AppendRequest<D>,
        tx: oneshot::Sender<ServerResult<AppendResponse>>,
    },
    Sync {
        rpc: SyncRequest<D>,
        tx: oneshot::Sender<ServerResult<AppendResponse>>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<ServerResult<VoteResponse>>,
    },
    Poll {
        rpc: PollRequest,
        tx: oneshot::Sender<ServerResult<PollResponse>>,
    },
    Register {
        rpc: RegisterRequest,
        tx: RegisterTx,
    },
    KeepAlive {
        rpc: KeepAliveRequest,
        tx: KeepAliveTx,
    },
    Unregister {
        rpc: UnregisterRequest,
        tx: UnregisterTx,
    },
    Command {
        rpc: CommandRequest<D>,
        tx: CommandTx<R>,
    },
    Query {
        rpc: QueryRequest<D>,
        tx: QueryTx<R>,
    },
    Join {
        rpc: JoinRequest,
        tx: ConfigTx,
    },
    Leave {
        rpc: LeaveRequest,
        tx: ConfigTx,
    },
    Promote {
        rpc: PromoteRequest,
        tx: ConfigTx,
    },
    Demote {
        rpc: DemoteRequest,
        tx: ConfigTx,
    },
    /// Ask this server to leave its cluster gracefully.
    BeginLeave { tx: LeaveTx },
}

/// Construction parameters for one server.
pub struct ServerOptions {
    /// The directory holding the segmented log and vote metadata.
    pub dir: PathBuf,
    /// The address peers and clients reach this server under.
    pub address: String,
    /// The membership this server boots with, at version 0. Servers listed
    /// here start as members; everyone else goes through the join
    /// handshake.
    pub seed: Membership,
    /// The membership kind this server works toward. A joining server
    /// enters passive and, with `MemberKind::Active`, asks for promotion
    /// once it has caught up.
    pub target_kind: MemberKind,
}

struct ServerInner<D, R, N, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    N: Transport<D> + EventTransport<M::Event>,
{
    tx_api: mpsc::UnboundedSender<(ServerMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<ServerMetrics>,
    core_handle: Mutex<Option<JoinHandle<ServerResult<()>>>>,
    applier_handle: Mutex<Option<JoinHandle<()>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    dir: PathBuf,
    marker_n: std::marker::PhantomData<N>,
    marker_m: std::marker::PhantomData<M>,
}

/// A running catamaran server.
///
/// This type is the interface to a spawned server task: RPC intake from the
/// transport layer, session traffic from clients, reconfiguration, and
/// lifecycle. It is cheap to clone.
pub struct Server<D, R, N, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    N: Transport<D> + EventTransport<M::Event>,
{
    inner: Arc<ServerInner<D, R, N, M>>,
}

impl<D, R, N, M> Clone for Server<D, R, N, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    N: Transport<D> + EventTransport<M::Event>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, R, N, M> Server<D, R, N, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    N: Transport<D> + EventTransport<M::Event>,
{
    /// Create and spawn a new server task.
    ///
    /// This opens the log under `options.dir` (creating it when absent),
    /// spawns the state machine context for `state_machine`, seeds the
    /// membership, and enters the Joining role.
    #[tracing::instrument(level="debug", skip(config, transport, state_machine, options), fields(cluster=%config.cluster_name))]
    pub fn spawn(id: NodeId, config: Arc<Config>, transport: Arc<N>, state_machine: M, options: ServerOptions) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ServerMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (compaction_tx, compaction_rx) = mpsc::unbounded_channel();

        let applier_handle = Applier::spawn(
            id,
            config.clone(),
            state_machine,
            transport.clone(),
            options.seed.clone(),
            apply_rx,
            compaction_rx,
        );

        let dir = options.dir.clone();
        let core_handle = ServerCore::spawn(
            id,
            config,
            CoreOptions {
                dir: options.dir,
                address: options.address,
                target_kind: options.target_kind,
                seed: options.seed,
            },
            transport,
            apply_tx,
            compaction_tx,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );

        let inner = ServerInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            applier_handle: Mutex::new(Some(applier_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            dir,
            marker_n: std::marker::PhantomData,
            marker_m: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    fn send(&self, msg: ServerMsg<D, R>) -> Result<(), ServerError> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| ServerError::Shutdown)
    }

    fn send_client(&self, msg: ServerMsg<D, R>) -> Result<(), ClientError> {
        self.send(msg).map_err(|_| ClientError::Shutdown)
    }

    /// Submit an Append RPC to this server.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append(&self, rpc: AppendRequest<D>) -> ServerResult<AppendResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Append { rpc, tx })?;
        rx.await.map_err(|_| ServerError::Shutdown).and_then(|res| res)
    }

    /// Submit a Sync RPC to this server.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn sync(&self, rpc: SyncRequest<D>) -> ServerResult<AppendResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Sync { rpc, tx })?;
        rx.await.map_err(|_| ServerError::Shutdown).and_then(|res| res)
    }

    /// Submit a Vote RPC to this server.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> ServerResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Vote { rpc, tx })?;
        rx.await.map_err(|_| ServerError::Shutdown).and_then(|res| res)
    }

    /// Submit a pre-vote Poll RPC to this server.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll(&self, rpc: PollRequest) -> ServerResult<PollResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMsg::Poll { rpc, tx })?;
        rx.await.map_err(|_| ServerError::Shutdown).and_then(|res| res)
    }

    /// Open a session on this cluster. Succeeds only on the leader.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn register(&self, rpc: RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Register { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Renew a session.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn keep_alive(&self, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::KeepAlive { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Close a session.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn unregister(&self, rpc: UnregisterRequest) -> Result<UnregisterResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Unregister { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Submit a sessioned command.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn command(&self, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Command { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Submit a sessioned query.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn query(&self, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Query { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Ask this server (as leader) to admit a new member.
    #[tracing::instrument(level = "debug", skip(self), fields(member=rpc.member.id))]
    pub async fn join(&self, rpc: JoinRequest) -> Result<ConfigurationResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Join { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Ask this server (as leader) to remove a member.
    #[tracing::instrument(level = "debug", skip(self), fields(member=rpc.member.id))]
    pub async fn leave(&self, rpc: LeaveRequest) -> Result<ConfigurationResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Leave { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Ask this server (as leader) to promote a passive member.
    #[tracing::instrument(level = "debug", skip(self), fields(member=rpc.member.id))]
    pub async fn promote(&self, rpc: PromoteRequest) -> Result<ConfigurationResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Promote { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Ask this server (as leader) to demote an active member.
    #[tracing::instrument(level = "debug", skip(self), fields(member=rpc.member.id))]
    pub async fn demote(&self, rpc: DemoteRequest) -> Result<ConfigurationResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::Demote { rpc, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// Leave the cluster gracefully: the membership entry removing this
    /// server is committed before it stops.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn leave_cluster(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ServerMsg::BeginLeave { tx })?;
        rx.await.map_err(|_| ClientError::Shutdown).and_then(|res| res)
    }

    /// The current cluster leader, as far as this server knows.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ServerMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this server down and wait for its tasks to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        if let Some(handle) = self.inner.applier_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Remove this server's storage directory. Allowed only after
    /// `shutdown` has completed.
    pub async fn delete(&self) -> ServerResult<()> {
        if self.inner.core_handle.lock().await.is_some() {
            return Err(ServerError::IllegalState(
                "delete is only allowed on a shut down server".into(),
            ));
        }
        std::fs::remove_dir_all(&self.inner.dir).map_err(crate::error::StorageError::from)?;
        Ok(())
    }
}
