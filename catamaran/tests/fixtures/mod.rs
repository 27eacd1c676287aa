//! Fixtures for testing catamaran clusters.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use catamaran::async_trait::async_trait;
use catamaran::client::Client;
use catamaran::client::ClientTransport;
use catamaran::error::ClientError;
use catamaran::membership::Member;
use catamaran::membership::MemberKind;
use catamaran::membership::Membership;
use catamaran::metrics::ServerMetrics;
use catamaran::metrics::Wait;
use catamaran::network::EventTransport;
use catamaran::network::Transport;
use catamaran::protocol::AppendRequest;
use catamaran::protocol::AppendResponse;
use catamaran::protocol::CommandRequest;
use catamaran::protocol::CommandResponse;
use catamaran::protocol::ConfigurationResponse;
use catamaran::protocol::JoinRequest;
use catamaran::protocol::KeepAliveRequest;
use catamaran::protocol::KeepAliveResponse;
use catamaran::protocol::LeaveRequest;
use catamaran::protocol::PollRequest;
use catamaran::protocol::PollResponse;
use catamaran::protocol::PromoteRequest;
use catamaran::protocol::PublishRequest;
use catamaran::protocol::PublishResponse;
use catamaran::protocol::QueryRequest;
use catamaran::protocol::QueryResponse;
use catamaran::protocol::RegisterRequest;
use catamaran::protocol::RegisterResponse;
use catamaran::protocol::SyncRequest;
use catamaran::protocol::UnregisterRequest;
use catamaran::protocol::UnregisterResponse;
use catamaran::protocol::VoteRequest;
use catamaran::protocol::VoteResponse;
use catamaran::storage::Log;
use catamaran::Config;
use catamaran::Entry;
use catamaran::NodeId;
use catamaran::Server;
use catamaran::ServerOptions;
use catamaran::State;
use memapp::KvEvent;
use memapp::KvRequest;
use memapp::KvResponse;
use memapp::KvState;
use memapp::MemApp;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete server type used during testing.
pub type KvServer = Server<KvRequest, KvResponse, Router, MemApp>;
/// A concrete client type used during testing.
pub type KvClient = Client<KvRequest, KvResponse, KvEvent, Router>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A cluster configuration with timings tuned for in-process tests.
///
/// Compaction keeps its production cadence here: most scenarios compare
/// logs entry for entry across nodes, and a compaction pass landing on one
/// node but not another mid-assertion would make those comparisons racy.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(300)
            .heartbeat_interval(50)
            .session_timeout(5_000)
            .probe_delay(20)
            .probe_rounds(150)
            .segment_entries(16)
            .validate()
            .expect("failed to build test config"),
    )
}

/// Like [`test_config`], but with compaction ticking fast enough to observe
/// within a test and segments small enough to seal after a handful of
/// entries.
pub fn test_config_with_fast_compaction() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(300)
            .heartbeat_interval(50)
            .session_timeout(5_000)
            .probe_delay(20)
            .probe_rounds(150)
            .segment_entries(4)
            .minor_compaction_interval(200)
            .major_compaction_interval(800)
            .validate()
            .expect("failed to build test config"),
    )
}

/// A type which emulates a network transport between servers and clients.
pub struct Router {
    /// The runtime config all nodes share.
    config: Arc<Config>,
    /// All servers currently known to this router.
    table: RwLock<BTreeMap<NodeId, KvServer>>,
    /// The observable state machine of each server.
    states: RwLock<BTreeMap<NodeId, Arc<RwLock<KvState>>>>,
    /// Storage directories, kept alive for the router's lifetime.
    dirs: std::sync::Mutex<HashMap<NodeId, tempfile::TempDir>>,
    /// Isolated nodes can neither send nor receive frames.
    isolated: RwLock<HashSet<NodeId>>,
    /// Clients by connection id, for event delivery.
    clients: RwLock<HashMap<u64, KvClient>>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            table: RwLock::new(BTreeMap::new()),
            states: RwLock::new(BTreeMap::new()),
            dirs: std::sync::Mutex::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn seed_of(ids: &BTreeSet<NodeId>) -> Membership {
        Membership::seed(ids.iter().map(|id| Member::new(*id, format!("node-{}", id))))
    }

    /// Spawn a server seeded with the given active members.
    pub async fn new_server(self: &Arc<Self>, id: NodeId, seed: &BTreeSet<NodeId>) {
        let dir = tempfile::tempdir().expect("failed to create log directory");
        let app = MemApp::new();
        let handle = app.handle();
        let server = Server::spawn(id, self.config.clone(), self.clone(), app, ServerOptions {
            dir: dir.path().to_path_buf(),
            address: format!("node-{}", id),
            seed: Self::seed_of(seed),
            target_kind: MemberKind::Active,
        });
        self.dirs.lock().expect("dirs lock poisoned").insert(id, dir);
        self.states.write().await.insert(id, handle);
        self.table.write().await.insert(id, server);
    }

    /// Spawn every node of a fresh cluster with a shared seed membership.
    pub async fn new_cluster(self: &Arc<Self>, ids: &BTreeSet<NodeId>) {
        for id in ids {
            self.new_server(*id, ids).await;
        }
    }

    /// Create a client routed over the current set of servers.
    pub async fn new_client(self: &Arc<Self>) -> (KvClient, mpsc::UnboundedReceiver<KvEvent>) {
        let servers: Vec<NodeId> = self.table.read().await.keys().copied().collect();
        let (client, events) = Client::new(self.config.clone(), self.clone(), servers);
        self.clients.write().await.insert(client.connection(), client.clone());
        (client, events)
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    pub async fn server(&self, id: NodeId) -> Result<KvServer> {
        let table = self.table.read().await;
        table.get(&id).cloned().with_context(|| format!("node {} not found in routing table", id))
    }

    /// The observable state machine of the given node.
    pub async fn state(&self, id: NodeId) -> Result<Arc<RwLock<KvState>>> {
        let states = self.states.read().await;
        states.get(&id).cloned().with_context(|| format!("node {} not found", id))
    }

    /// Get a payload of the latest metrics from each node.
    pub async fn latest_metrics(&self) -> Vec<ServerMetrics> {
        let table = self.table.read().await;
        table.values().map(|server| server.metrics().borrow().clone()).collect()
    }

    /// The ID of the current non-isolated leader, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated.read().await;
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.state == State::Leader && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    pub async fn wait(&self, id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let server = self.server(*id).await?;
        Ok(server.wait(timeout))
    }

    /// Wait for metrics on a node until they satisfy some condition.
    pub async fn wait_for_metrics<T>(
        &self,
        id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<ServerMetrics>
    where
        T: Fn(&ServerMetrics) -> bool + Send,
    {
        let wait = self.wait(id, timeout).await?;
        Ok(wait.metrics(func, msg).await?)
    }

    /// Wait until each given node has applied up to `want` (inclusive).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_applied(
        &self,
        ids: &BTreeSet<NodeId>,
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in ids {
            self.wait(id, timeout).await?.applied(want, msg).await?;
        }
        Ok(())
    }

    /// Wait until each given node enters the wanted role.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(
        &self,
        ids: &BTreeSet<NodeId>,
        want: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in ids {
            self.wait(id, timeout).await?.state(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for some non-isolated node to become leader.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Read an entry straight from a node's log directory.
    pub async fn read_log_entry(&self, id: NodeId, index: u64) -> Result<Option<Entry<KvRequest>>> {
        let path = {
            let dirs = self.dirs.lock().expect("dirs lock poisoned");
            dirs.get(&id).with_context(|| format!("no log directory for node {}", id))?.path().to_path_buf()
        };
        let log = Log::<KvRequest>::open(&path, self.config.segment_entries)?;
        Ok(log.get(index)?)
    }

    /// The first and last slot indexes of a node's log.
    pub async fn log_bounds(&self, id: NodeId) -> Result<(u64, u64)> {
        let path = {
            let dirs = self.dirs.lock().expect("dirs lock poisoned");
            dirs.get(&id).with_context(|| format!("no log directory for node {}", id))?.path().to_path_buf()
        };
        let log = Log::<KvRequest>::open(&path, self.config.segment_entries)?;
        Ok((log.first_index(), log.last_index()))
    }

    /// Send a command directly to a node, bypassing the client core. Used
    /// to exercise resubmission with an explicit session and sequence.
    pub async fn direct_command(
        &self,
        target: NodeId,
        session: u64,
        sequence: u64,
        operation: KvRequest,
    ) -> Result<CommandResponse<KvResponse>, ClientError> {
        ClientTransport::command(self, target, CommandRequest {
            session,
            sequence,
            operation,
        })
        .await
    }

    /// Send a register directly to a node, bypassing the client core.
    pub async fn direct_register(
        &self,
        target: NodeId,
        connection: u64,
    ) -> Result<RegisterResponse, ClientError> {
        ClientTransport::register(self, target, RegisterRequest {
            connection,
            timeout: 0,
        })
        .await
    }

    /// Assert that the non-isolated part of the cluster has exactly one
    /// leader and that every node agrees on term and applied index.
    pub async fn assert_stable_cluster(&self, expect_term: Option<u64>, expect_last_applied: Option<u64>) {
        let isolated = self.isolated.read().await;
        let metrics: Vec<ServerMetrics> = self
            .latest_metrics()
            .await
            .into_iter()
            .filter(|m| !isolated.contains(&m.id))
            .collect();

        let leaders: Vec<NodeId> = metrics.iter().filter(|m| m.state == State::Leader).map(|m| m.id).collect();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
        let leader = leaders[0];
        let leader_metrics = metrics.iter().find(|m| m.id == leader).expect("leader metrics are present");

        let term = expect_term.unwrap_or(leader_metrics.current_term);
        let applied = expect_last_applied.unwrap_or(leader_metrics.last_applied);

        for m in metrics.iter() {
            assert_eq!(m.current_term, term, "node {} has term {}, expected {}", m.id, m.current_term, term);
            assert_eq!(
                m.current_leader,
                Some(leader),
                "node {} sees leader {:?}, expected {}",
                m.id,
                m.current_leader,
                leader
            );
            assert_eq!(
                m.last_applied, applied,
                "node {} has last_applied {}, expected {}",
                m.id, m.last_applied, applied
            );
        }
    }

    async fn is_isolated(&self, id: NodeId) -> bool {
        self.isolated.read().await.contains(&id)
    }

    async fn reach(&self, sender: NodeId, target: NodeId) -> Result<KvServer> {
        let isolated = self.isolated.read().await;
        if isolated.contains(&sender) || isolated.contains(&target) {
            return Err(anyhow!("node {} or {} is isolated", sender, target));
        }
        drop(isolated);
        self.server(target).await
    }

    async fn reach_as_client(&self, target: NodeId) -> Result<KvServer, ClientError> {
        if self.is_isolated(target).await {
            return Err(ClientError::ConnectionLost);
        }
        let table = self.table.read().await;
        table.get(&target).cloned().ok_or(ClientError::ConnectionLost)
    }
}

#[async_trait]
impl Transport<KvRequest> for Router {
    async fn append(&self, target: NodeId, rpc: AppendRequest<KvRequest>) -> Result<AppendResponse> {
        let server = self.reach(rpc.leader, target).await?;
        Ok(server.append(rpc).await?)
    }

    async fn sync(&self, target: NodeId, rpc: SyncRequest<KvRequest>) -> Result<AppendResponse> {
        let server = self.reach(rpc.leader, target).await?;
        Ok(server.sync(rpc).await?)
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let server = self.reach(rpc.candidate, target).await?;
        Ok(server.vote(rpc).await?)
    }

    async fn poll(&self, target: NodeId, rpc: PollRequest) -> Result<PollResponse> {
        let server = self.reach(rpc.candidate, target).await?;
        Ok(server.poll(rpc).await?)
    }

    async fn join(&self, target: NodeId, rpc: JoinRequest) -> Result<ConfigurationResponse, ClientError> {
        if self.is_isolated(rpc.member.id).await {
            return Err(ClientError::ConnectionLost);
        }
        let server = self.reach_as_client(target).await?;
        server.join(rpc).await
    }

    async fn leave(&self, target: NodeId, rpc: LeaveRequest) -> Result<ConfigurationResponse, ClientError> {
        if self.is_isolated(rpc.member.id).await {
            return Err(ClientError::ConnectionLost);
        }
        let server = self.reach_as_client(target).await?;
        server.leave(rpc).await
    }

    async fn promote(&self, target: NodeId, rpc: PromoteRequest) -> Result<ConfigurationResponse, ClientError> {
        if self.is_isolated(rpc.member.id).await {
            return Err(ClientError::ConnectionLost);
        }
        let server = self.reach_as_client(target).await?;
        server.promote(rpc).await
    }
}

#[async_trait]
impl EventTransport<KvEvent> for Router {
    async fn publish(&self, connection: u64, rpc: PublishRequest<KvEvent>) -> Result<PublishResponse> {
        let client = {
            let clients = self.clients.read().await;
            clients.get(&connection).cloned()
        };
        match client {
            Some(client) => Ok(client.handle_publish(rpc).await),
            None => Err(anyhow!("no client with connection {}", connection)),
        }
    }
}

#[async_trait]
impl ClientTransport<KvRequest, KvResponse> for Router {
    async fn register(&self, target: NodeId, rpc: RegisterRequest) -> Result<RegisterResponse, ClientError> {
        self.reach_as_client(target).await?.register(rpc).await
    }

    async fn keep_alive(&self, target: NodeId, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, ClientError> {
        self.reach_as_client(target).await?.keep_alive(rpc).await
    }

    async fn unregister(&self, target: NodeId, rpc: UnregisterRequest) -> Result<UnregisterResponse, ClientError> {
        self.reach_as_client(target).await?.unregister(rpc).await
    }

    async fn command(
        &self,
        target: NodeId,
        rpc: CommandRequest<KvRequest>,
    ) -> Result<CommandResponse<KvResponse>, ClientError> {
        self.reach_as_client(target).await?.command(rpc).await
    }

    async fn query(
        &self,
        target: NodeId,
        rpc: QueryRequest<KvRequest>,
    ) -> Result<QueryResponse<KvResponse>, ClientError> {
        self.reach_as_client(target).await?.query(rpc).await
    }
}
