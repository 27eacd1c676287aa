//! The state machine execution context.
//!
//! A dedicated task owns the session table and the user state machine, so
//! long-running application code never blocks the consensus loop. Committed
//! entries arrive in strict index order over a channel; per-batch
//! completions flow back and drive `last_applied` on the consensus side.
//!
//! Because this task also answers compaction retention questions, all
//! session-dependent retention logic lives here as well, behind the same
//! single-threaded ownership.

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::From;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::entry::KeepAliveEntry;
use crate::entry::OperationEntry;
use crate::entry::RegisterEntry;
use crate::entry::UnregisterEntry;
use crate::error::ClientError;
use crate::membership::Member;
use crate::membership::Membership;
use crate::network::EventTransport;
use crate::protocol::CommandResponse;
use crate::protocol::ConfigurationResponse;
use crate::protocol::KeepAliveResponse;
use crate::protocol::PublishRequest;
use crate::protocol::QueryResponse;
use crate::protocol::RegisterResponse;
use crate::protocol::UnregisterResponse;
use crate::server::CommandTx;
use crate::server::ConfigTx;
use crate::server::KeepAliveTx;
use crate::server::QueryTx;
use crate::server::RegisterTx;
use crate::server::UnregisterTx;
use crate::session::ParkedQuery;
use crate::session::SessionTable;
use crate::state_machine::Commit;
use crate::state_machine::FilterCommit;
use crate::state_machine::StateMachine;
use crate::storage::compaction::CompactionQuery;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::SessionId;

/// The response channel a committed entry carries into the applier.
#[derive(From)]
pub(crate) enum ResponderTx<R: AppDataResponse> {
    Register(RegisterTx),
    KeepAlive(KeepAliveTx),
    Unregister(UnregisterTx),
    Command(CommandTx<R>),
    Query(QueryTx<R>),
    Configuration(ConfigTx),
    #[from(ignore)]
    None,
}

impl<R: AppDataResponse> ResponderTx<R> {
    /// Fail the waiting caller with the given error.
    pub(crate) fn fail(self, err: ClientError) {
        match self {
            ResponderTx::Register(tx) => {
                let _ = tx.send(Err(err));
            }
            ResponderTx::KeepAlive(tx) => {
                let _ = tx.send(Err(err));
            }
            ResponderTx::Unregister(tx) => {
                let _ = tx.send(Err(err));
            }
            ResponderTx::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            ResponderTx::Query(tx) => {
                let _ = tx.send(Err(err));
            }
            ResponderTx::Configuration(tx) => {
                let _ = tx.send(Err(err));
            }
            ResponderTx::None => {}
        }
    }

    /// Answer the waiting caller with a leader redirect.
    pub(crate) fn redirect(self, leader: Option<NodeId>) {
        self.fail(ClientError::NoLeader { leader });
    }
}

/// A message into the state machine context.
pub(crate) enum ApplyMsg<D: AppData, R: AppDataResponse> {
    /// Committed entries in ascending index order (holes permitted where
    /// compaction removed entries), with the response channels of entries
    /// this server accepted from clients.
    Entries {
        entries: Vec<Arc<Entry<D>>>,
        txs: HashMap<u64, ResponderTx<R>>,
        done: oneshot::Sender<Option<LogId>>,
    },
    /// A sequential-consistency query: executed against applied state
    /// without touching the log, still ordered behind the session's own
    /// commands.
    Query {
        session: SessionId,
        sequence: u64,
        operation: D,
        tx: QueryTx<R>,
    },
}

/// The outcome of one publish attempt.
struct PublishOutcome {
    session: SessionId,
    sent: u64,
    ack: Option<u64>,
}

/// The task owning the session table and the user state machine.
pub(crate) struct Applier<D, R, N, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    N: EventTransport<M::Event>,
{
    id: NodeId,
    sm: M,
    sessions: SessionTable<D, R, M::Event>,
    /// The membership as applied, for the member lists in responses.
    membership: Membership,
    last_applied: LogId,
    rx: mpsc::UnboundedReceiver<ApplyMsg<D, R>>,
    compaction_rx: mpsc::UnboundedReceiver<CompactionQuery<D>>,
    transport: Arc<N>,
    outcome_tx: mpsc::UnboundedSender<PublishOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<PublishOutcome>,
    /// How often stalled event deliveries are retried.
    pump_interval: Duration,
}

impl<D, R, N, M> Applier<D, R, N, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    N: EventTransport<M::Event>,
{
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        sm: M,
        transport: Arc<N>,
        seed: Membership,
        rx: mpsc::UnboundedReceiver<ApplyMsg<D, R>>,
        compaction_rx: mpsc::UnboundedReceiver<CompactionQuery<D>>,
    ) -> JoinHandle<()> {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let this = Self {
            id,
            sm,
            sessions: SessionTable::new(config.session_timeout),
            membership: seed,
            last_applied: LogId::default(),
            rx,
            compaction_rx,
            transport,
            outcome_tx,
            outcome_rx,
            pump_interval: Duration::from_millis(config.heartbeat_interval),
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("state-machine", id)))
    }

    async fn main(mut self) {
        let mut pump_tick = tokio::time::interval_at(Instant::now() + self.pump_interval, self.pump_interval);
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(ApplyMsg::Entries { entries, txs, done }) => self.apply_batch(entries, txs, done).await,
                    Some(ApplyMsg::Query { session, sequence, operation, tx }) => {
                        self.sequential_query(session, sequence, operation, tx).await;
                    }
                    None => {
                        tracing::debug!("apply channel closed; state machine context stopping");
                        return;
                    }
                },
                Some(query) = self.compaction_rx.recv() => self.answer_compaction_query(query).await,
                Some(outcome) = self.outcome_rx.recv() => self.handle_publish_outcome(outcome),
                _ = pump_tick.tick() => self.pump_publishes(),
            }
        }
    }

    async fn apply_batch(
        &mut self,
        entries: Vec<Arc<Entry<D>>>,
        mut txs: HashMap<u64, ResponderTx<R>>,
        done: oneshot::Sender<Option<LogId>>,
    ) {
        for entry in entries {
            let tx = txs.remove(&entry.log_id.index);
            self.apply_entry(&entry, tx).await;
        }
        let _ = done.send(Some(self.last_applied));
    }

    /// Apply one committed entry, in order, advancing the log clock and
    /// sweeping expired sessions afterwards.
    async fn apply_entry(&mut self, entry: &Entry<D>, tx: Option<ResponderTx<R>>) {
        debug_assert!(
            entry.log_id.index > self.last_applied.index,
            "entries must apply in ascending index order"
        );
        tracing::debug!(entry = %entry.summary(), "applying entry");

        let index = entry.log_id.index;
        let timestamp = entry.timestamp;
        match &entry.payload {
            EntryPayload::NoOp => {
                if let Some(tx) = tx {
                    tx.fail(ClientError::IllegalRequest("no-op entries carry no response".into()));
                }
            }
            EntryPayload::Register(e) => self.apply_register(index, timestamp, e, tx).await,
            EntryPayload::KeepAlive(e) => self.apply_keep_alive(index, timestamp, e, tx),
            EntryPayload::Unregister(e) => self.apply_unregister(e, tx).await,
            EntryPayload::Command(e) => self.apply_command(index, timestamp, e, tx).await,
            EntryPayload::Query(e) => self.apply_query(index, timestamp, e, tx).await,
            EntryPayload::Configuration(e) => {
                self.membership = e.to_membership(index);
                match tx {
                    Some(ResponderTx::Configuration(tx)) => {
                        let _ = tx.send(Ok(ConfigurationResponse {
                            version: index,
                            active: e.active.values().cloned().collect(),
                            passive: e.passive.values().cloned().collect(),
                        }));
                    }
                    Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
                    None => {}
                }
            }
        }

        self.last_applied = entry.log_id;

        // The log clock advanced; expire what it left behind.
        if timestamp > 0 {
            self.expire_sessions(timestamp).await;
        }
        self.pump_publishes();
    }

    async fn apply_register(&mut self, index: u64, timestamp: u64, e: &RegisterEntry, tx: Option<ResponderTx<R>>) {
        let session = self.sessions.register(index, e.connection, e.timeout, timestamp);
        let timeout = session.timeout();
        tracing::info!(session = index, connection = e.connection, timeout, "session registered");
        self.sm.session_registered(session).await;

        match tx {
            Some(ResponderTx::Register(tx)) => {
                let _ = tx.send(Ok(RegisterResponse {
                    session: index,
                    timeout,
                    leader: self.id,
                    members: self.members(),
                }));
            }
            Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
            None => {}
        }
    }

    fn apply_keep_alive(&mut self, index: u64, timestamp: u64, e: &KeepAliveEntry, tx: Option<ResponderTx<R>>) {
        let res = match self.sessions.lookup(e.session) {
            Ok(session) => {
                session.keep_alive(index, timestamp, e.command_sequence, e.event_sequence);
                Ok(())
            }
            Err(err) => Err(err),
        };
        match tx {
            Some(ResponderTx::KeepAlive(tx)) => {
                let _ = tx.send(res.map(|_| KeepAliveResponse {
                    leader: self.id,
                    members: self.members(),
                }));
            }
            Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
            None => {}
        }
    }

    async fn apply_unregister(&mut self, e: &UnregisterEntry, tx: Option<ResponderTx<R>>) {
        let res = match self.sessions.close(e.session) {
            Ok(mut session) => {
                tracing::info!(session = e.session, "session closed");
                for (_, queries) in std::mem::take(&mut session.queries) {
                    for query in queries {
                        let _ = query.tx.send(Err(ClientError::UnknownSession(e.session)));
                    }
                }
                self.sm.session_closed(&session).await;
                Ok(())
            }
            Err(err) => Err(err),
        };
        match tx {
            Some(ResponderTx::Unregister(tx)) => {
                let _ = tx.send(res.map(|_| UnregisterResponse { leader: self.id }));
            }
            Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
            None => {}
        }
    }

    /// Apply a command with at-most-once semantics: a sequence at or below
    /// the session's command version is answered from the response cache
    /// and never reaches the state machine again.
    async fn apply_command(&mut self, index: u64, timestamp: u64, e: &OperationEntry<D>, tx: Option<ResponderTx<R>>) {
        let session = match self.sessions.lookup(e.session) {
            Ok(session) => session,
            Err(err) => {
                if let Some(tx) = tx {
                    tx.fail(err);
                }
                return;
            }
        };
        session.touch(index, timestamp);

        if session.is_applied(e.sequence) {
            let cached = session.replay(e.sequence);
            tracing::debug!(session = e.session, sequence = e.sequence, "command replayed from cache");
            match tx {
                Some(ResponderTx::Command(tx)) => {
                    let _ = tx.send(match cached {
                        Some(Ok(result)) => Ok(CommandResponse { index, result }),
                        Some(Err(app_err)) => Err(ClientError::Application(app_err)),
                        None => Err(ClientError::IllegalRequest(
                            "command response was acknowledged and dropped".into(),
                        )),
                    });
                }
                Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
                None => {}
            }
            return;
        }

        let commit = Commit {
            index,
            timestamp,
            session,
            operation: &e.operation,
        };
        let result = self.sm.apply(commit).await;
        let stored: Result<R, String> = result.map_err(|err| format!("{:#}", err));

        if let Ok(session) = self.sessions.lookup(e.session) {
            session.record_response(e.sequence, stored.clone());
        }

        match tx {
            Some(ResponderTx::Command(tx)) => {
                let _ = tx.send(match stored {
                    Ok(result) => Ok(CommandResponse { index, result }),
                    Err(app_err) => Err(ClientError::Application(app_err)),
                });
            }
            Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
            None => {}
        }

        // The command may release queries parked at its sequence.
        let released = match self.sessions.lookup(e.session) {
            Ok(session) => session.release_queries(e.sequence),
            Err(_) => Vec::new(),
        };
        for parked in released {
            let at = if parked.index > 0 { parked.index } else { index };
            self.run_query(e.session, at, parked.operation, parked.tx).await;
        }
    }

    /// Apply a query entry: run it if the session has caught up to the
    /// query's causal point, park it otherwise. Only entries this server
    /// accepted carry a response channel; on every other server a query
    /// entry is a no-op.
    async fn apply_query(&mut self, index: u64, timestamp: u64, e: &OperationEntry<D>, tx: Option<ResponderTx<R>>) {
        let session = match self.sessions.lookup(e.session) {
            Ok(session) => session,
            Err(err) => {
                if let Some(tx) = tx {
                    tx.fail(err);
                }
                return;
            }
        };
        session.touch(index, timestamp);

        let runnable = session.command_version() >= e.sequence;
        match tx {
            Some(ResponderTx::Query(tx)) => {
                if runnable {
                    self.run_query(e.session, index, e.operation.clone(), tx).await;
                } else {
                    tracing::debug!(
                        session = e.session,
                        sequence = e.sequence,
                        "query parked until its command sequence applies"
                    );
                    session.park_query(e.sequence, ParkedQuery {
                        index,
                        operation: e.operation.clone(),
                        tx,
                    });
                }
            }
            Some(tx) => tx.fail(ClientError::IllegalRequest("mismatched response channel".into())),
            None => {}
        }
    }

    /// A sequential-consistency read: same session ordering rules, no log
    /// entry, executed at the applied index.
    async fn sequential_query(&mut self, session_id: SessionId, sequence: u64, operation: D, tx: QueryTx<R>) {
        let at = self.last_applied.index;
        let session = match self.sessions.lookup(session_id) {
            Ok(session) => session,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        if session.command_version() >= sequence {
            self.run_query(session_id, at, operation, tx).await;
        } else {
            session.park_query(sequence, ParkedQuery {
                index: 0,
                operation,
                tx,
            });
        }
    }

    /// Execute a query against the state machine and answer its caller.
    async fn run_query(&mut self, session_id: SessionId, at: u64, operation: D, tx: QueryTx<R>) {
        let session = match self.sessions.lookup(session_id) {
            Ok(session) => session,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let timestamp = session.timestamp;
        let commit = Commit {
            index: at,
            timestamp,
            session,
            operation: &operation,
        };
        let res = self.sm.apply(commit).await;
        let _ = tx.send(match res {
            Ok(result) => Ok(QueryResponse { index: at, result }),
            Err(err) => Err(ClientError::Application(format!("{:#}", err))),
        });
    }

    /// Expire every session whose timeout elapsed at log time `now`.
    async fn expire_sessions(&mut self, now: u64) {
        let expired = self.sessions.expire_stale(now);
        for mut session in expired {
            tracing::info!(session = session.id(), "session expired");
            for (_, queries) in std::mem::take(&mut session.queries) {
                for query in queries {
                    let _ = query.tx.send(Err(ClientError::SessionExpired(session.id())));
                }
            }
            self.sm.session_expired(&session).await;
        }
    }

    /// Push the next buffered event of every session with a free wire slot.
    fn pump_publishes(&mut self) {
        let mut sends = Vec::new();
        for session in self.sessions.iter_mut() {
            if let Some((sequence, event)) = session.next_publish() {
                sends.push((session.id(), session.connection(), sequence, event));
            }
        }
        for (session, connection, sequence, event) in sends {
            let transport = self.transport.clone();
            let outcome_tx = self.outcome_tx.clone();
            tokio::spawn(
                async move {
                    let rpc = PublishRequest {
                        session,
                        sequence,
                        event,
                    };
                    let outcome = match transport.publish(connection, rpc).await {
                        Ok(res) => PublishOutcome {
                            session,
                            sent: sequence,
                            ack: Some(res.ack),
                        },
                        Err(err) => {
                            tracing::debug!(session, sequence, error=%err, "publish failed; will retry");
                            PublishOutcome {
                                session,
                                sent: sequence,
                                ack: None,
                            }
                        }
                    };
                    let _ = outcome_tx.send(outcome);
                }
                .instrument(tracing::debug_span!("publish", session, sequence)),
            );
        }
    }

    fn handle_publish_outcome(&mut self, outcome: PublishOutcome) {
        if let Ok(session) = self.sessions.lookup(outcome.session) {
            match outcome.ack {
                Some(ack) => session.publish_acked(outcome.sent, ack),
                None => session.publish_failed(),
            }
        }
        self.pump_publishes();
    }

    /// Answer a retention question from the compaction task.
    async fn answer_compaction_query(&mut self, query: CompactionQuery<D>) {
        match query {
            CompactionQuery::Bound { tx } => {
                let _ = tx.send(self.last_applied.index);
            }
            CompactionQuery::Filter { entry, compaction, tx } => {
                let index = entry.log_id.index;
                let keep = match &entry.payload {
                    // A register lives exactly as long as its session.
                    EntryPayload::Register(_) => self.sessions.contains(index),
                    // Only the latest keep-alive per session is retained.
                    EntryPayload::KeepAlive(e) => self
                        .sessions
                        .get(e.session)
                        .map(|s| s.keep_alive_index == index)
                        .unwrap_or(false),
                    // An unregister outlives nothing: its session is gone.
                    EntryPayload::Unregister(e) => self.sessions.contains(e.session),
                    // The latest configuration must always survive.
                    EntryPayload::Configuration(_) => {
                        index >= self.membership.version || index >= self.last_applied.index
                    }
                    EntryPayload::Command(e) => {
                        let commit = FilterCommit {
                            index,
                            timestamp: entry.timestamp,
                            session: e.session,
                            operation: &e.operation,
                        };
                        self.sm.filter(commit, compaction).await.unwrap_or(true)
                    }
                    // The compaction task decides these inline.
                    EntryPayload::NoOp | EntryPayload::Query(_) => true,
                };
                let _ = tx.send(keep);
            }
        }
    }

    fn members(&self) -> Vec<Member> {
        self.membership
            .active
            .values()
            .chain(self.membership.passive.values())
            .cloned()
            .collect()
    }
}
