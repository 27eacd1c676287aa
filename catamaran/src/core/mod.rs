//! The core logic of a catamaran server.

mod admin;
mod append_entries;
pub(crate) mod apply;
mod client_ops;
mod vote;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::admin::ConfigChange;
use crate::core::apply::ApplyMsg;
use crate::core::apply::ResponderTx;
use crate::core::client_ops::PendingRequest;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::ServerError;
use crate::error::ServerResult;
use crate::membership::Member;
use crate::membership::MemberKind;
use crate::membership::MemberStatus;
use crate::membership::Membership;
use crate::metrics::LeaderMetrics;
use crate::metrics::ReplicationMetrics;
use crate::metrics::ServerMetrics;
use crate::network::Transport;
use crate::protocol::ConfigurationResponse;
use crate::replication::PeerEvent;
use crate::replication::ReplicationEvent;
use crate::replication::ReplicationStream;
use crate::server::LeaveTx;
use crate::server::QueryTx;
use crate::server::ServerMsg;
use crate::storage::compaction::CompactionQuery;
use crate::storage::CompactionWatermarks;
use crate::storage::Log;
use crate::storage::MetaStore;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::SessionId;
use crate::Update;

/// The leader clock: wall time in milliseconds, stamped into entries at
/// append and thereafter the only time sessions are measured against.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// All possible roles of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Negotiating admission into the cluster.
    Joining,
    /// Replicating entries through Sync; neither voting nor timing out.
    Passive,
    /// Replicating entries from the leader, voting, timing out.
    Follower,
    /// Campaigning to become the cluster leader.
    Candidate,
    /// The cluster leader.
    Leader,
    /// Negotiating removal from the cluster.
    Leaving,
    /// The terminal state; the server has stopped.
    Shutdown,
}

impl State {
    pub fn is_joining(&self) -> bool {
        matches!(self, Self::Joining)
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, Self::Passive)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    pub fn is_leaving(&self) -> bool {
        matches!(self, Self::Leaving)
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(crate) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The durable and volatile state driving one server's role machine.
pub(crate) struct ServerCore<D: AppData, R: AppDataResponse, N: Transport<D>> {
    /// This server's ID.
    pub(crate) id: NodeId,
    /// This server's runtime config.
    pub(crate) config: Arc<Config>,
    /// This server's own transport address.
    pub(crate) address: String,
    /// The membership kind this server wants to end up with.
    pub(crate) target_kind: MemberKind,
    /// The cluster's current membership view.
    pub(crate) membership: Membership,
    /// The `Transport` implementation.
    pub(crate) transport: Arc<N>,
    /// The segmented log.
    pub(crate) log: Arc<Log<D>>,
    /// Durable term & vote state.
    meta: MetaStore,

    /// The target role of the server.
    pub(crate) target_state: State,

    /// The index of the highest entry known to be committed cluster-wide.
    ///
    /// Initialized to 0 on boot; a restarted server re-learns it from the
    /// leader. It is never safe to initialize it from local state.
    pub(crate) commit_index: u64,
    /// The index replicated to every active member.
    pub(crate) global_index: u64,
    /// The id of the highest entry applied to the state machine.
    pub(crate) last_applied: LogId,
    /// The highest index handed to the state machine context. Entries are
    /// dispatched exactly once, in order, from a single place.
    dispatched_index: u64,

    /// The current term.
    pub(crate) current_term: u64,
    /// The current cluster leader, as far as this server knows.
    pub(crate) current_leader: Option<NodeId>,
    /// The candidate this server voted for in the current term.
    ///
    /// At most one vote per term; the value only clears when the term moves.
    pub(crate) voted_for: Option<NodeId>,

    /// The id of the last entry appended to the log.
    pub(crate) last_log_id: LogId,

    /// True once a graceful leave was requested; reaching a configuration
    /// without this server then means Shutdown rather than idling.
    pub(crate) leaving: bool,
    pub(crate) leave_tx: Option<LeaveTx>,

    /// The channel into the state machine context.
    apply_tx: mpsc::UnboundedSender<ApplyMsg<D, R>>,
    /// Completions of dispatched apply batches, folded back into the role
    /// loops to advance `last_applied` without ever blocking on user code.
    apply_handles: FuturesOrdered<oneshot::Receiver<Option<LogId>>>,
    /// The compaction watermarks published to the compaction task.
    watermarks_tx: watch::Sender<CompactionWatermarks>,

    pub(crate) rx_api: mpsc::UnboundedReceiver<(ServerMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<ServerMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,

    /// The deadline of the running election timer, when one is armed.
    next_election_timeout: Option<Instant>,
}

/// Everything `ServerCore::spawn` needs besides channels.
pub(crate) struct CoreOptions {
    pub dir: PathBuf,
    pub address: String,
    pub target_kind: MemberKind,
    pub seed: Membership,
}

impl<D: AppData, R: AppDataResponse, N: Transport<D>> ServerCore<D, R, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        options: CoreOptions,
        transport: Arc<N>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg<D, R>>,
        compaction_queries: mpsc::UnboundedSender<CompactionQuery<D>>,
        rx_api: mpsc::UnboundedReceiver<(ServerMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<ServerMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<ServerResult<()>> {
        tokio::spawn(
            async move {
                let log = Arc::new(Log::<D>::open(&options.dir, config.segment_entries)?);
                let meta = MetaStore::new(&options.dir);

                let (watermarks_tx, watermarks_rx) = watch::channel(CompactionWatermarks::default());
                crate::storage::compaction::Compactor::spawn(
                    log.clone(),
                    compaction_queries,
                    watermarks_rx,
                    &config,
                );

                let this = ServerCore {
                    id,
                    config,
                    address: options.address,
                    target_kind: options.target_kind,
                    membership: options.seed,
                    transport,
                    log,
                    meta,
                    target_state: State::Joining,
                    commit_index: 0,
                    global_index: 0,
                    last_applied: LogId::default(),
                    dispatched_index: 0,
                    current_term: 0,
                    current_leader: None,
                    voted_for: None,
                    last_log_id: LogId::default(),
                    leaving: false,
                    leave_tx: None,
                    apply_tx,
                    apply_handles: FuturesOrdered::new(),
                    watermarks_tx,
                    rx_api,
                    tx_metrics,
                    rx_shutdown,
                    next_election_timeout: None,
                };
                this.main().await
            }
            .instrument(tracing::debug_span!("spawn")),
        )
    }

    /// The main loop of the server.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> ServerResult<()> {
        tracing::debug!("server is initializing");

        let hard = self.meta.load()?;
        self.current_term = hard.current_term;
        self.voted_for = hard.voted_for;
        self.last_log_id = self.log.last_log_id();

        // The most recent Configuration entry in the log supersedes the
        // seed configuration.
        if let Some((index, config)) = self.log.latest_configuration()? {
            if index > self.membership.version {
                self.membership = config.to_membership(index);
            }
        }

        tracing::debug!(
            term = self.current_term,
            last_log = %self.last_log_id,
            membership = %self.membership.summary(),
            "recovered state"
        );
        self.report_metrics(Update::Update(None));

        // The central role loop: each role owns the server until it asks
        // for a transition, Shutdown being terminal.
        loop {
            match &self.target_state {
                State::Joining => JoiningState::new(&mut self).run().await?,
                State::Passive => PassiveState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Leaving => LeavingState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("server has shut down");
                    self.report_metrics(Update::Update(None));
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the server.
    pub(crate) fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(ServerMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            global_index: self.global_index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership: self.membership.clone(),
            leader_metrics,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the server's current hard state to disk.
    pub(crate) fn save_hard_state(&mut self) -> ServerResult<()> {
        let hs = crate::storage::HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.meta.save(&hs).map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Record a vote for `candidate` in `term`, persisting it first.
    ///
    /// A server casts at most one vote per term; changing an existing vote
    /// within the same term is an error. Clearing only happens through a
    /// term change.
    pub(crate) fn set_vote(&mut self, term: u64, candidate: NodeId) -> ServerResult<()> {
        if term == self.current_term {
            if let Some(prior) = self.voted_for {
                if prior != candidate {
                    return Err(ServerError::IllegalState(format!(
                        "already voted for {} in term {}",
                        prior, term
                    )));
                }
            }
        }
        self.current_term = term;
        self.voted_for = Some(candidate);
        self.save_hard_state()
    }

    /// Update the core's target role, ensuring invariants are upheld.
    pub(crate) fn set_target_state(&mut self, target_state: State) {
        tracing::debug!(id = self.id, ?target_state, "state transition requested");
        if target_state == State::Follower && !self.membership.is_active(&self.id) {
            self.target_state = State::Passive;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not armed.
    pub(crate) fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Re-arm the election timer with a fresh randomized deadline.
    pub(crate) fn update_next_election_timeout(&mut self) {
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(Instant::now() + t);
    }

    pub(crate) fn disarm_election_timeout(&mut self) {
        self.next_election_timeout = None;
    }

    /// Update the value of the `current_leader` property.
    pub(crate) fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Adopt a higher term. The vote clears as part of the term change.
    pub(crate) fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Adopt a new membership view and follow the role it assigns us.
    ///
    /// Leaders defer their own transitions to the commit of the
    /// Configuration entry (see the admin handlers); everyone else follows
    /// the view as soon as it is stored.
    pub(crate) fn update_membership(&mut self, membership: Membership) {
        if membership.version < self.membership.version {
            return;
        }
        self.membership = membership;

        if self.target_state.is_leader() || self.target_state.is_candidate() {
            return;
        }

        if !self.membership.contains(&self.id) {
            if self.leaving {
                if let Some(tx) = self.leave_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                self.set_target_state(State::Shutdown);
            } else if !self.target_state.is_joining() {
                // Removed without asking: idle as a non-member.
                self.set_target_state(State::Passive);
            }
        } else if self.membership.is_active(&self.id) {
            if matches!(self.target_state, State::Passive | State::Joining) {
                self.set_target_state(State::Follower);
            }
        } else if self.membership.is_passive(&self.id) && self.target_state.is_follower() {
            self.set_target_state(State::Passive);
        }
        self.report_metrics(Update::Ignore);
    }

    /// Advance the commit and global indexes (both monotone) and hand any
    /// newly committed entries to the state machine context.
    pub(crate) fn advance_watermarks(
        &mut self,
        commit: u64,
        global: u64,
        txs: HashMap<u64, ResponderTx<R>>,
    ) -> ServerResult<()> {
        if commit > self.commit_index {
            self.commit_index = commit;
        }
        if global > self.global_index {
            self.global_index = global;
        }
        let _ = self.watermarks_tx.send_replace(CompactionWatermarks {
            commit: self.commit_index,
            global: self.global_index,
        });
        self.dispatch_committed(txs)
    }

    /// Hand committed entries past the dispatch cursor to the state machine
    /// context, in index order, exactly once.
    fn dispatch_committed(&mut self, txs: HashMap<u64, ResponderTx<R>>) -> ServerResult<()> {
        let upto = self.commit_index.min(self.last_log_id.index);
        if upto <= self.dispatched_index {
            return Ok(());
        }
        let entries = match self.log.range(self.dispatched_index + 1, upto) {
            Ok(entries) => entries,
            Err(err) => return Err(self.map_fatal_storage_error(err)),
        };
        let (done_tx, done_rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyMsg::Entries {
                entries,
                txs,
                done: done_tx,
            })
            .map_err(|_| ServerError::Shutdown)?;
        self.apply_handles.push_back(done_rx);
        self.dispatched_index = upto;
        Ok(())
    }

    /// Handle the completion of an apply batch.
    pub(crate) fn handle_apply_result(&mut self, res: Option<LogId>) {
        if let Some(last_applied) = res {
            self.last_applied = last_applied;
        }
        self.report_metrics(Update::Ignore);
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    pub(crate) fn map_fatal_storage_error(&mut self, err: crate::error::StorageError) -> ServerError {
        tracing::error!(error=%err, id=self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        ServerError::Storage(err)
    }

    /// Append an entry in the current term, stamping the leader clock.
    pub(crate) fn append_entry(&mut self, payload: EntryPayload<D>) -> ServerResult<Arc<Entry<D>>> {
        let entry = self
            .log
            .append(self.current_term, now_millis(), payload)
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = entry.log_id;
        Ok(Arc::new(entry))
    }

    /// Run a sequential-consistency query directly against applied state.
    pub(crate) fn sequential_query(&self, session: SessionId, sequence: u64, operation: D, tx: QueryTx<R>) {
        let msg = ApplyMsg::Query {
            session,
            sequence,
            operation,
            tx,
        };
        if let Err(tokio::sync::mpsc::error::SendError(msg)) = self.apply_tx.send(msg) {
            if let ApplyMsg::Query { tx, .. } = msg {
                let _ = tx.send(Err(crate::error::ClientError::Shutdown));
            }
        }
    }

    /// A snapshot of the membership for reconfiguration responses.
    pub(crate) fn configuration_response(&self) -> ConfigurationResponse {
        ConfigurationResponse {
            version: self.membership.version,
            active: self.membership.active.values().cloned().collect(),
            passive: self.membership.passive.values().cloned().collect(),
        }
    }

    /// This server as a member record.
    pub(crate) fn local_member(&self) -> Member {
        Member::new(self.id, self.address.clone())
    }

    /// Answer a client or admin request with a redirect to the leader.
    pub(crate) fn redirect<T>(&self, tx: oneshot::Sender<Result<T, crate::error::ClientError>>) {
        let _ = tx.send(Err(crate::error::ClientError::NoLeader {
            leader: self.current_leader,
        }));
    }

    /// Handle a message the way every non-leader role does: answer the
    /// consensus RPCs, redirect everything session- or config-shaped.
    pub(crate) async fn handle_common(&mut self, msg: ServerMsg<D, R>) -> ServerResult<()> {
        match msg {
            ServerMsg::Append { rpc, tx } => {
                let _ = tx.send(self.handle_append_request(rpc).await);
            }
            ServerMsg::Sync { rpc, tx } => {
                let _ = tx.send(self.handle_sync_request(rpc).await);
            }
            ServerMsg::Vote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc));
            }
            ServerMsg::Poll { rpc, tx } => {
                let _ = tx.send(self.handle_poll_request(rpc));
            }
            ServerMsg::Register { tx, .. } => self.redirect(tx),
            ServerMsg::KeepAlive { tx, .. } => self.redirect(tx),
            ServerMsg::Unregister { tx, .. } => self.redirect(tx),
            ServerMsg::Command { tx, .. } => self.redirect(tx),
            ServerMsg::Query { tx, .. } => self.redirect(tx),
            ServerMsg::Join { tx, .. } => self.redirect(tx),
            ServerMsg::Leave { tx, .. } => self.redirect(tx),
            ServerMsg::Promote { tx, .. } => self.redirect(tx),
            ServerMsg::Demote { tx, .. } => self.redirect(tx),
            ServerMsg::BeginLeave { tx } => self.begin_leave(tx),
        }
        Ok(())
    }

    /// Start a graceful departure from the cluster.
    pub(crate) fn begin_leave(&mut self, tx: LeaveTx) {
        if !self.membership.contains(&self.id) {
            let _ = tx.send(Ok(()));
            self.set_target_state(State::Shutdown);
            return;
        }
        self.leaving = true;
        self.leave_tx = Some(tx);
        if !self.target_state.is_leader() {
            self.set_target_state(State::Leaving);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader.
pub(crate) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: Transport<D>> {
    pub(super) core: &'a mut ServerCore<D, R, N>,
    /// The replication state of every peer, active and passive.
    pub(super) nodes: BTreeMap<NodeId, ReplicaState<D>>,
    /// Requests appended locally and awaiting cluster commitment.
    pub(super) awaiting_committed: Vec<PendingRequest<D, R>>,
    /// The index of the uncommitted Configuration entry, if one is pending.
    /// At most one exists at a time.
    pub(super) pending_config: Option<u64>,
    /// Reconfigurations queued behind the pending one, served in order.
    pub(super) config_queue: VecDeque<(ConfigChange, admin::ConfigTx)>,
    /// Leader observability.
    pub(super) leader_metrics: LeaderMetrics,

    pub(super) replication_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,
    pub(super) replication_rx: mpsc::UnboundedReceiver<(PeerEvent, Span)>,
}

/// The leader's view of one replication stream.
pub(crate) struct ReplicaState<D: AppData> {
    pub matched: LogId,
    pub kind: MemberKind,
    pub status: MemberStatus,
    /// Once the config entry at this index is replicated to the peer, the
    /// stream shuts down: the peer is out of the cluster.
    pub remove_after_commit: Option<u64>,
    pub stream: ReplicationStream<D>,
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> LeaderState<'a, D, R, N> {
    pub(self) fn new(core: &'a mut ServerCore<D, R, N>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            awaiting_committed: Vec::new(),
            pending_config: None,
            config_queue: VecDeque::new(),
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> ServerResult<()> {
        // Spawn replication streams for every peer.
        let peers = self.core.membership.peers_of(self.core.id);
        for (member, kind) in peers {
            let state = self.spawn_replication_stream(member.id, kind);
            self.nodes.insert(member.id, state);
        }

        self.core.disarm_election_timeout();
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8 of the Raft paper, commit an entry of the new term early.
        // The no-op indirectly commits everything from prior terms.
        self.commit_initial_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!(id = self.core.id, state = ?self.core.target_state, "leaving leader state");
                for node in self.nodes.values() {
                    let _ = node.stream.tx.send((ReplicationEvent::Terminate, tracing::debug_span!("CH")));
                }
                for req in self.awaiting_committed.drain(..) {
                    req.tx.redirect(self.core.current_leader);
                }
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.handle_msg(msg).await?;
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    self.handle_peer_event(event).await?;
                }
                Some(Ok(res)) = self.core.apply_handles.next() => {
                    self.core.handle_apply_result(res);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader received shutdown signal");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: ServerMsg<D, R>) -> ServerResult<()> {
        match msg {
            ServerMsg::Append { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_request(rpc).await);
            }
            ServerMsg::Sync { rpc, tx } => {
                let _ = tx.send(self.core.handle_sync_request(rpc).await);
            }
            ServerMsg::Vote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc));
            }
            ServerMsg::Poll { rpc, tx } => {
                let _ = tx.send(self.core.handle_poll_request(rpc));
            }
            ServerMsg::Register { rpc, tx } => self.handle_register(rpc, tx)?,
            ServerMsg::KeepAlive { rpc, tx } => self.handle_keep_alive(rpc, tx)?,
            ServerMsg::Unregister { rpc, tx } => self.handle_unregister(rpc, tx)?,
            ServerMsg::Command { rpc, tx } => self.handle_command(rpc, tx)?,
            ServerMsg::Query { rpc, tx } => self.handle_query(rpc, tx)?,
            ServerMsg::Join { rpc, tx } => self.handle_join(rpc, tx)?,
            ServerMsg::Leave { rpc, tx } => self.handle_leave(rpc, tx)?,
            ServerMsg::Promote { rpc, tx } => self.handle_promote(rpc, tx)?,
            ServerMsg::Demote { rpc, tx } => self.handle_demote(rpc, tx)?,
            ServerMsg::BeginLeave { tx } => self.handle_begin_leave(tx)?,
        }
        Ok(())
    }

    /// Handle an event coming off a replication stream.
    async fn handle_peer_event(&mut self, event: PeerEvent) -> ServerResult<()> {
        tracing::debug!(event = %event.summary(), "replica event");
        match event {
            PeerEvent::UpdateMatched { target, matched } => {
                let removed = {
                    let node = match self.nodes.get_mut(&target) {
                        Some(node) => node,
                        None => return Ok(()),
                    };
                    node.matched = matched;
                    node.status = MemberStatus::Alive;
                    node.remove_after_commit.map(|idx| matched.index >= idx).unwrap_or(false)
                };
                if removed {
                    tracing::info!(target, "peer replicated its removal config; dropping stream");
                    if let Some(node) = self.nodes.remove(&target) {
                        let _ = node.stream.tx.send((ReplicationEvent::Terminate, tracing::debug_span!("CH")));
                    }
                    self.leader_metrics.replication.remove(&target);
                }
                self.recompute_commitment()?;
                self.leader_report_metrics();
            }
            PeerEvent::Unreachable { target } => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.status = MemberStatus::Dead;
                }
                self.leader_report_metrics();
            }
            PeerEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(target, term, "observed higher term from peer, stepping down");
                    self.core.update_current_term(term, None);
                    self.core.save_hard_state()?;
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                }
            }
            PeerEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
        Ok(())
    }

    /// Spawn a replication stream for the target peer.
    pub(super) fn spawn_replication_stream(&self, target: NodeId, kind: MemberKind) -> ReplicaState<D> {
        let stream = ReplicationStream::spawn(
            self.core.id,
            target,
            kind,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.global_index,
            self.core.transport.clone(),
            self.core.log.clone(),
            self.replication_tx.clone(),
        );
        ReplicaState {
            matched: LogId::default(),
            kind,
            status: MemberStatus::Alive,
            remove_after_commit: None,
            stream,
        }
    }

    /// Append the no-op every new leader commits to anchor its term.
    async fn commit_initial_entry(&mut self) -> ServerResult<()> {
        let entry = self.core.append_entry(EntryPayload::NoOp)?;
        self.awaiting_committed.push(PendingRequest {
            entry: entry.clone(),
            tx: ResponderTx::None,
        });
        self.replicate(entry)?;
        Ok(())
    }

    /// Offer a freshly appended entry to every replication stream and
    /// re-evaluate commitment (a single-server cluster commits on append).
    pub(super) fn replicate(&mut self, entry: Arc<Entry<D>>) -> ServerResult<()> {
        for node in self.nodes.values() {
            let _ = node.stream.tx.send((
                ReplicationEvent::Replicate {
                    entry: entry.clone(),
                    commit_index: self.core.commit_index,
                    global_index: self.core.global_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
        self.leader_report_metrics();
        self.recompute_commitment()
    }

    /// The commit rule: the highest index replicated to a quorum of active
    /// members (self included) whose entry is of the current term. The
    /// global index is the floor across every active member.
    fn recompute_commitment(&mut self) -> ServerResult<()> {
        let mut active_indexes: Vec<u64> = vec![self.core.last_log_id.index];
        for node in self.nodes.values() {
            if node.kind == MemberKind::Active && node.remove_after_commit.is_none() {
                active_indexes.push(node.matched.index);
            }
        }
        active_indexes.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = self.core.membership.quorum();
        if active_indexes.len() < quorum {
            return Ok(());
        }

        let global = *active_indexes.last().expect("active index set is never empty");
        let candidate = active_indexes[quorum - 1];

        let commit = if candidate > self.core.commit_index
            && self.core.log.term_of(candidate) == Some(self.core.current_term)
        {
            candidate
        } else {
            self.core.commit_index
        };

        if commit == self.core.commit_index && global == self.core.global_index {
            return Ok(());
        }

        // Collect response channels for entries that just committed, and
        // act on committed Configuration entries.
        let mut txs = HashMap::new();
        let mut still_waiting = Vec::with_capacity(self.awaiting_committed.len());
        let mut committed_configs = Vec::new();
        for req in self.awaiting_committed.drain(..) {
            if req.entry.log_id.index <= commit {
                if let EntryPayload::Configuration(_) = &req.entry.payload {
                    committed_configs.push(req.entry.log_id.index);
                }
                txs.insert(req.entry.log_id.index, req.tx);
            } else {
                still_waiting.push(req);
            }
        }
        self.awaiting_committed = still_waiting;

        self.core.advance_watermarks(commit, global, txs)?;

        for node in self.nodes.values() {
            let _ = node.stream.tx.send((
                ReplicationEvent::UpdateCommit {
                    commit_index: self.core.commit_index,
                    global_index: self.core.global_index,
                },
                tracing::debug_span!("CH"),
            ));
        }

        for index in committed_configs {
            self.handle_configuration_committed(index)?;
        }
        self.leader_report_metrics();
        Ok(())
    }

    /// Report metrics with leader specific state.
    pub(super) fn leader_report_metrics(&mut self) {
        self.leader_metrics.replication = self
            .nodes
            .iter()
            .map(|(id, node)| {
                (*id, ReplicationMetrics {
                    matched: node.matched,
                    status: node.status,
                })
            })
            .collect();
        let metrics = self.leader_metrics.clone();
        self.core.report_metrics(Update::Update(Some(&metrics)));
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a server in follower state.
pub(crate) struct FollowerState<'a, D: AppData, R: AppDataResponse, N: Transport<D>> {
    core: &'a mut ServerCore<D, R, N>,
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> FollowerState<'a, D, R, N> {
    pub(self) fn new(core: &'a mut ServerCore<D, R, N>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> ServerResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // Silence from the leader for a full timeout: campaign.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.core.handle_common(msg).await?;
                }
                Some(Ok(res)) = self.core.apply_handles.next() => self.core.handle_apply_result(res),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a server in candidate state.
pub(crate) struct CandidateState<'a, D: AppData, R: AppDataResponse, N: Transport<D>> {
    core: &'a mut ServerCore<D, R, N>,
    /// Votes granted in the running election round.
    pub(super) votes_granted: usize,
    /// Votes needed to win: a quorum of active members.
    pub(super) votes_needed: usize,
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> CandidateState<'a, D, R, N> {
    pub(self) fn new(core: &'a mut ServerCore<D, R, N>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> ServerResult<()> {
        // Each iteration of the outer loop is one election round.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Pre-vote: make sure a majority would entertain an election
            // before disturbing the term. A partitioned minority keeps
            // polling without ever inflating its term.
            self.core.update_next_election_timeout();
            if !self.poll_round().await? {
                if self.core.target_state.is_candidate() {
                    self.core.set_target_state(State::Follower);
                    self.core.update_next_election_timeout();
                }
                return Ok(());
            }
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // The real election.
            self.votes_granted = 1; // Our own vote.
            self.votes_needed = self.core.membership.quorum();
            self.core.update_next_election_timeout();
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state()?;
            self.core.report_metrics(Update::Update(None));
            tracing::info!(term = self.core.current_term, "campaigning for leadership");

            if self.votes_granted >= self.votes_needed {
                // A single active member elects itself.
                self.core.set_target_state(State::Leader);
                continue;
            }

            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this election round.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // The round timed out; the outer loop starts the next.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer)?,
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        self.core.handle_common(msg).await?;
                    }
                    Some(Ok(res)) = self.core.apply_handles.next() => self.core.handle_apply_result(res),
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a server in passive state.
pub(crate) struct PassiveState<'a, D: AppData, R: AppDataResponse, N: Transport<D>> {
    core: &'a mut ServerCore<D, R, N>,
    /// Outcome channel for an in-flight promote request.
    promote_rx: Option<oneshot::Receiver<Result<ConfigurationResponse, crate::error::ClientError>>>,
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> PassiveState<'a, D, R, N> {
    pub(self) fn new(core: &'a mut ServerCore<D, R, N>) -> Self {
        Self {
            core,
            promote_rx: None,
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="passive"))]
    pub(self) async fn run(mut self) -> ServerResult<()> {
        self.core.disarm_election_timeout();
        self.core.report_metrics(Update::Update(None));

        let tick = Duration::from_millis(self.core.config.heartbeat_interval * 2);
        let mut promote_tick = tokio::time::interval_at(Instant::now() + tick, tick);

        loop {
            if !self.core.target_state.is_passive() {
                return Ok(());
            }

            tokio::select! {
                _ = promote_tick.tick() => self.maybe_request_promotion(),
                res = async { self.promote_rx.as_mut().expect("polled without in-flight promote").await },
                        if self.promote_rx.is_some() => {
                    self.promote_rx = None;
                    match res {
                        Ok(Ok(config)) => {
                            let membership = Membership {
                                version: config.version,
                                active: config.active.into_iter().map(|m| (m.id, m)).collect(),
                                passive: config.passive.into_iter().map(|m| (m.id, m)).collect(),
                            };
                            self.core.update_membership(membership);
                        }
                        Ok(Err(err)) => tracing::debug!(error=%err, "promotion attempt rejected"),
                        Err(_) => {}
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.core.handle_common(msg).await?;
                }
                Some(Ok(res)) = self.core.apply_handles.next() => self.core.handle_apply_result(res),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Ask the leader for promotion once this server is a caught-up passive
    /// member that wants to vote.
    fn maybe_request_promotion(&mut self) {
        if self.promote_rx.is_some()
            || self.core.target_kind != MemberKind::Active
            || !self.core.membership.is_passive(&self.core.id)
            || self.core.commit_index == 0
            || self.core.last_log_id.index < self.core.commit_index
        {
            return;
        }
        let leader = match self.core.current_leader {
            Some(leader) if leader != self.core.id => leader,
            _ => return,
        };

        tracing::info!(leader, "caught up; requesting promotion to active");
        let (tx, rx) = oneshot::channel();
        self.promote_rx = Some(rx);
        let transport = self.core.transport.clone();
        let rpc = crate::protocol::PromoteRequest {
            member: self.core.local_member(),
        };
        tokio::spawn(
            async move {
                let res = transport.promote(leader, rpc).await;
                let _ = tx.send(res);
            }
            .instrument(tracing::debug_span!("promote")),
        );
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a server negotiating admission.
pub(crate) struct JoiningState<'a, D: AppData, R: AppDataResponse, N: Transport<D>> {
    core: &'a mut ServerCore<D, R, N>,
    join_rx: Option<oneshot::Receiver<Result<ConfigurationResponse, crate::error::ClientError>>>,
    /// Round-robin cursor over known members, biased by leader hints.
    next_target: Option<NodeId>,
    cursor: usize,
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> JoiningState<'a, D, R, N> {
    pub(self) fn new(core: &'a mut ServerCore<D, R, N>) -> Self {
        Self {
            core,
            join_rx: None,
            next_target: None,
            cursor: 0,
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="joining"))]
    pub(self) async fn run(mut self) -> ServerResult<()> {
        self.core.report_metrics(Update::Update(None));

        // A server listed in the configuration it booted with needs no
        // handshake: the listing Configuration entry already exists.
        if let Some(kind) = self.core.membership.kind_of(&self.core.id) {
            match kind {
                MemberKind::Active => self.core.set_target_state(State::Follower),
                MemberKind::Passive => self.core.set_target_state(State::Passive),
            }
            return Ok(());
        }

        let delay = Duration::from_millis(self.core.config.probe_delay.max(1) * 4);
        let mut probe = tokio::time::interval_at(Instant::now(), delay);

        loop {
            if !self.core.target_state.is_joining() {
                return Ok(());
            }

            tokio::select! {
                _ = probe.tick() => self.probe_join(),
                res = async { self.join_rx.as_mut().expect("polled without in-flight join").await },
                        if self.join_rx.is_some() => {
                    self.join_rx = None;
                    match res {
                        Ok(Ok(config)) => {
                            let membership = Membership {
                                version: config.version,
                                active: config.active.into_iter().map(|m| (m.id, m)).collect(),
                                passive: config.passive.into_iter().map(|m| (m.id, m)).collect(),
                            };
                            tracing::info!(version = membership.version, "admitted to cluster");
                            self.core.update_membership(membership);
                        }
                        Ok(Err(crate::error::ClientError::NoLeader { leader })) => {
                            self.next_target = leader;
                        }
                        Ok(Err(err)) => tracing::debug!(error=%err, "join attempt failed"),
                        Err(_) => {}
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    // Replication may reach us before the join response does;
                    // the common handler applies Configuration entries which
                    // complete the admission just as well.
                    self.core.handle_common(msg).await?;
                }
                Some(Ok(res)) = self.core.apply_handles.next() => self.core.handle_apply_result(res),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    fn probe_join(&mut self) {
        if self.join_rx.is_some() {
            return;
        }
        let peers: Vec<NodeId> = self.core.membership.all_ids().filter(|id| *id != self.core.id).collect();
        if peers.is_empty() {
            tracing::warn!("no peers to join through; configure this server in the seed membership");
            return;
        }
        let target = match self.next_target.take() {
            Some(target) if peers.contains(&target) => target,
            _ => {
                let target = peers[self.cursor % peers.len()];
                self.cursor += 1;
                target
            }
        };

        tracing::debug!(target, "sending join request");
        let (tx, rx) = oneshot::channel();
        self.join_rx = Some(rx);
        let transport = self.core.transport.clone();
        let rpc = crate::protocol::JoinRequest {
            member: self.core.local_member(),
        };
        tokio::spawn(
            async move {
                let res = transport.join(target, rpc).await;
                let _ = tx.send(res);
            }
            .instrument(tracing::debug_span!("join")),
        );
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a server negotiating removal.
pub(crate) struct LeavingState<'a, D: AppData, R: AppDataResponse, N: Transport<D>> {
    core: &'a mut ServerCore<D, R, N>,
    leave_rx: Option<oneshot::Receiver<Result<ConfigurationResponse, crate::error::ClientError>>>,
    next_target: Option<NodeId>,
    cursor: usize,
    attempts: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> LeavingState<'a, D, R, N> {
    pub(self) fn new(core: &'a mut ServerCore<D, R, N>) -> Self {
        Self {
            core,
            leave_rx: None,
            next_target: None,
            cursor: 0,
            attempts: 0,
        }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leaving"))]
    pub(self) async fn run(mut self) -> ServerResult<()> {
        self.core.report_metrics(Update::Update(None));
        self.core.disarm_election_timeout();

        if !self.core.membership.contains(&self.core.id) {
            if let Some(tx) = self.core.leave_tx.take() {
                let _ = tx.send(Ok(()));
            }
            self.core.set_target_state(State::Shutdown);
            return Ok(());
        }

        let delay = Duration::from_millis(self.core.config.probe_delay.max(1) * 4);
        let mut probe = tokio::time::interval_at(Instant::now(), delay);

        loop {
            if !self.core.target_state.is_leaving() {
                return Ok(());
            }

            tokio::select! {
                _ = probe.tick() => {
                    if self.attempts >= self.core.config.probe_rounds {
                        tracing::warn!("giving up on graceful leave; shutting down");
                        if let Some(tx) = self.core.leave_tx.take() {
                            let _ = tx.send(Err(crate::error::ClientError::Timeout));
                        }
                        self.core.set_target_state(State::Shutdown);
                        continue;
                    }
                    self.probe_leave();
                }
                res = async { self.leave_rx.as_mut().expect("polled without in-flight leave").await },
                        if self.leave_rx.is_some() => {
                    self.leave_rx = None;
                    match res {
                        Ok(Ok(config)) => {
                            let membership = Membership {
                                version: config.version,
                                active: config.active.into_iter().map(|m| (m.id, m)).collect(),
                                passive: config.passive.into_iter().map(|m| (m.id, m)).collect(),
                            };
                            // `update_membership` observes the removal and
                            // completes the shutdown.
                            self.core.update_membership(membership);
                        }
                        Ok(Err(crate::error::ClientError::NoLeader { leader })) => {
                            self.next_target = leader;
                        }
                        Ok(Err(err)) => tracing::debug!(error=%err, "leave attempt failed"),
                        Err(_) => {}
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.core.handle_common(msg).await?;
                }
                Some(Ok(res)) = self.core.apply_handles.next() => self.core.handle_apply_result(res),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    fn probe_leave(&mut self) {
        if self.leave_rx.is_some() {
            return;
        }
        let peers: Vec<NodeId> = self.core.membership.all_ids().filter(|id| *id != self.core.id).collect();
        if peers.is_empty() {
            // Sole member: nothing to negotiate with.
            if let Some(tx) = self.core.leave_tx.take() {
                let _ = tx.send(Ok(()));
            }
            self.core.set_target_state(State::Shutdown);
            return;
        }
        let target = match self.next_target.take() {
            Some(target) if peers.contains(&target) => target,
            _ => {
                let target = peers[self.cursor % peers.len()];
                self.cursor += 1;
                target
            }
        };
        self.attempts += 1;

        tracing::debug!(target, "sending leave request");
        let (tx, rx) = oneshot::channel();
        self.leave_rx = Some(rx);
        let transport = self.core.transport.clone();
        let rpc = crate::protocol::LeaveRequest {
            member: self.core.local_member(),
        };
        tokio::spawn(
            async move {
                let res = transport.leave(target, rpc).await;
                let _ = tx.send(res);
            }
            .instrument(tracing::debug_span!("leave")),
        );
    }
}
