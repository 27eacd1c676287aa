//! Replication streams.
//!
//! The leader runs one stream task per peer. Active peers receive Append
//! RPCs; passive peers receive Sync, which is the same payload under
//! relaxed rules (their acknowledgements never count toward commitment —
//! the leader enforces that, the stream just labels the traffic).
//!
//! A stream never pipelines payloads: it buffers until the previous payload
//! is acknowledged, so entries arrive at the peer in order.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::entry::Entry;
use crate::membership::MemberKind;
use crate::network::Transport;
use crate::protocol::AppendRequest;
use crate::protocol::AppendResponse;
use crate::protocol::SyncRequest;
use crate::storage::Log;
use crate::AppData;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the stream task.
    pub tx: mpsc::UnboundedSender<(ReplicationEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Spawn a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<N: Transport<D>>(
        id: NodeId,
        target: NodeId,
        kind: MemberKind,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        global_index: u64,
        transport: Arc<N>,
        log: Arc<Log<D>>,
        core_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let max_payload_entries = config.max_payload_entries;
        let this = ReplicationCore {
            id,
            target,
            kind,
            term,
            transport,
            log,
            max_payload_entries,
            target_state: StreamState::Lagging,
            last_log_index: last_log.index,
            commit_index,
            global_index,
            next_index: last_log.index + 1,
            // Optimistic: the consistency check corrects us via conflicts.
            matched: last_log,
            core_tx,
            rx,
            buffer: Vec::new(),
            outbound: Vec::new(),
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("replication", target)));
        Self { tx }
    }
}

/// An event from the leader to a replication stream.
pub(crate) enum ReplicationEvent<D: AppData> {
    /// A fresh entry to replicate, with the watermarks as of its append.
    Replicate {
        entry: Arc<Entry<D>>,
        commit_index: u64,
        global_index: u64,
    },
    /// New watermarks without new entries.
    UpdateCommit { commit_index: u64, global_index: u64 },
    Terminate,
}

/// An event from a replication stream back to the leader.
pub(crate) enum PeerEvent {
    /// The peer acknowledged entries up to `matched`.
    UpdateMatched { target: NodeId, matched: LogId },
    /// The peer did not answer its last RPC.
    Unreachable { target: NodeId },
    /// The peer answered with a newer term.
    RevertToFollower { target: NodeId, term: u64 },
    /// The stream hit a non-recoverable local error.
    Shutdown,
}

impl MessageSummary for PeerEvent {
    fn summary(&self) -> String {
        match self {
            PeerEvent::UpdateMatched { target, matched } => {
                format!("UpdateMatched: target: {}, matched: {}", target, matched)
            }
            PeerEvent::Unreachable { target } => format!("Unreachable: target: {}", target),
            PeerEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            PeerEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

/// The state of a replication stream.
#[derive(Debug, PartialEq, Eq)]
enum StreamState {
    /// Caught up; replicating entries as they are appended.
    LineRate,
    /// Behind; feeding from the log until caught up.
    Lagging,
    Shutdown,
}

/// The task replicating the log to one peer.
struct ReplicationCore<D: AppData, N: Transport<D>> {
    id: NodeId,
    target: NodeId,
    kind: MemberKind,
    /// The leader term this stream serves; it never changes.
    term: u64,

    transport: Arc<N>,
    log: Arc<Log<D>>,
    max_payload_entries: u64,

    target_state: StreamState,
    /// The index of the leader's most recent entry.
    last_log_index: u64,
    commit_index: u64,
    global_index: u64,
    /// The next index to send, decremented on conflicts.
    next_index: u64,
    /// The last log id known replicated on the target.
    matched: LogId,

    core_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,
    rx: mpsc::UnboundedReceiver<(ReplicationEvent<D>, Span)>,

    /// Entries streamed in from the leader, awaiting transmission.
    buffer: Vec<Arc<Entry<D>>>,
    /// The in-flight payload; retransmitted until acknowledged.
    outbound: Vec<Arc<Entry<D>>>,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
}

impl<D: AppData, N: Transport<D>> ReplicationCore<D, N> {
    #[tracing::instrument(level = "debug", skip(self), fields(id=self.id, target=self.target))]
    async fn main(mut self) {
        // An initial empty payload doubles as the leader's first heartbeat
        // and starts the consistency probe.
        self.send_payload().await;

        loop {
            match &self.target_state {
                StreamState::LineRate => self.line_rate_loop().await,
                StreamState::Lagging => self.lagging_loop().await,
                StreamState::Shutdown => return,
            }
        }
    }

    /// Send the current outbound payload (possibly empty) and handle the
    /// response.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_payload(&mut self) {
        if self.outbound.is_empty() && !self.buffer.is_empty() {
            let chunk = self.buffer.len().min(self.max_payload_entries as usize);
            self.outbound.extend(self.buffer.drain(..chunk));
        }

        let res = match self.kind {
            MemberKind::Active => {
                let rpc = AppendRequest {
                    term: self.term,
                    leader: self.id,
                    prev_log_id: self.matched,
                    entries: self.outbound.clone(),
                    commit_index: self.commit_index,
                    global_index: self.global_index,
                };
                timeout(self.heartbeat_timeout, self.transport.append(self.target, rpc)).await
            }
            MemberKind::Passive => {
                let rpc = SyncRequest {
                    term: self.term,
                    leader: self.id,
                    prev_log_id: self.matched,
                    entries: self.outbound.clone(),
                    commit_index: self.commit_index,
                    global_index: self.global_index,
                };
                timeout(self.heartbeat_timeout, self.transport.sync(self.target, rpc)).await
            }
        };

        let res: AppendResponse = match res {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(target=self.target, error=%err, "error sending replication rpc");
                let _ = self.core_tx.send((
                    PeerEvent::Unreachable { target: self.target },
                    tracing::debug_span!("CH"),
                ));
                return;
            }
            Err(_elapsed) => {
                tracing::warn!(target = self.target, "timeout while sending replication rpc");
                let _ = self.core_tx.send((
                    PeerEvent::Unreachable { target: self.target },
                    tracing::debug_span!("CH"),
                ));
                return;
            }
        };

        if res.success {
            if let Some(last) = self.outbound.last() {
                self.matched = last.log_id;
                self.next_index = last.log_id.index + 1;
                let _ = self.core_tx.send((
                    PeerEvent::UpdateMatched {
                        target: self.target,
                        matched: self.matched,
                    },
                    tracing::debug_span!("CH"),
                ));

                // A peer falling too far behind the live feed is fed from
                // the log instead.
                let behind = self.last_log_index.saturating_sub(self.matched.index);
                if behind > self.max_payload_entries {
                    self.target_state = StreamState::Lagging;
                }
            }
            self.outbound.clear();
            return;
        }

        // Never retransmit a rejected payload as-is; the conflict handling
        // below realigns the stream first.
        self.outbound.clear();

        if res.term > self.term {
            tracing::debug!(target = self.target, term = res.term, "peer is in a newer term");
            let _ = self.core_tx.send((
                PeerEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.target_state = StreamState::Shutdown;
            return;
        }

        match res.conflict {
            Some(conflict) => {
                tracing::debug!(target = self.target, %conflict, "realigning replication after conflict");
                self.next_index = conflict.index + 1;
                self.matched = conflict;
                // Trust our own log's term for the agreed-upon point when we
                // still hold that entry.
                if let Some(term) = self.log.term_of(conflict.index) {
                    self.matched.term = term;
                }
            }
            None => {
                // No hint; back off one step at a time.
                self.next_index = self.next_index.saturating_sub(1).max(1);
                self.matched = LogId {
                    term: self.log.term_of(self.next_index - 1).unwrap_or(0),
                    index: self.next_index.saturating_sub(1),
                };
            }
        }
        self.target_state = StreamState::Lagging;
    }

    /// Drain events coming in from the leader.
    fn drain_leader_events(&mut self, first: ReplicationEvent<D>, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0u64;
        loop {
            // Don't get stuck draining a hot feed forever.
            if iters > self.max_payload_entries {
                return;
            }
            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            let _ent = span.enter();

            match event {
                ReplicationEvent::Replicate {
                    entry,
                    commit_index,
                    global_index,
                } => {
                    self.commit_index = commit_index;
                    self.global_index = global_index;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == StreamState::LineRate {
                        self.buffer.push(entry);
                    }
                }
                ReplicationEvent::UpdateCommit {
                    commit_index,
                    global_index,
                } => {
                    self.commit_index = commit_index;
                    self.global_index = global_index;
                }
                ReplicationEvent::Terminate => {
                    self.target_state = StreamState::Shutdown;
                    return;
                }
            }

            if let Some(event_span) = self.rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != StreamState::LineRate {
                return;
            }

            // If the buffered window skipped entries (e.g. during the
            // transition from lagging), frontload them from the log.
            let next_buffered = self
                .outbound
                .first()
                .or_else(|| self.buffer.first())
                .map(|entry| entry.log_id.index)
                .unwrap_or(self.last_log_index + 1);
            if self.next_index < next_buffered {
                match self.log.range(self.next_index, next_buffered - 1) {
                    Ok(entries) => {
                        let mut filled = entries;
                        filled.extend(self.outbound.drain(..));
                        self.outbound = filled;
                    }
                    Err(err) => {
                        tracing::error!(error=%err, "error reading log while frontloading");
                        let _ = self.core_tx.send((PeerEvent::Shutdown, tracing::debug_span!("CH")));
                        self.target_state = StreamState::Shutdown;
                        return;
                    }
                }
                self.send_payload().await;
                continue;
            }

            // Fresh entries go out immediately; an unacknowledged outbound
            // payload waits for the next heartbeat tick so a down peer is
            // not hammered.
            if !self.buffer.is_empty() && self.outbound.is_empty() {
                self.send_payload().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_payload().await,
                event_span = self.rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_leader_events(event, span),
                        None => self.target_state = StreamState::Shutdown,
                    }
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    async fn lagging_loop(&mut self) {
        self.buffer.clear();
        self.outbound.clear();
        loop {
            if self.target_state != StreamState::Lagging {
                return;
            }
            if self.is_up_to_speed() {
                self.target_state = StreamState::LineRate;
                return;
            }

            // Feed the next payload straight from the log.
            if self.outbound.is_empty() {
                let stop = self
                    .last_log_index
                    .min(self.next_index + self.max_payload_entries - 1);
                match self.log.range(self.next_index, stop) {
                    Ok(entries) => self.outbound = entries,
                    Err(err) => {
                        tracing::error!(error=%err, "error reading log while lagging");
                        let _ = self.core_tx.send((PeerEvent::Shutdown, tracing::debug_span!("CH")));
                        self.target_state = StreamState::Shutdown;
                        return;
                    }
                }
                if self.outbound.is_empty() {
                    // Nothing left on disk for this window (fully compacted);
                    // skip ahead.
                    self.next_index = stop + 1;
                    if self.is_up_to_speed() {
                        self.target_state = StreamState::LineRate;
                        return;
                    }
                    continue;
                }
            }

            self.send_payload().await;
            if !self.outbound.is_empty() {
                // Unacknowledged payload: the peer is unreachable. Pace the
                // retries by the heartbeat.
                self.heartbeat.tick().await;
            }
            if self.is_up_to_speed() {
                self.target_state = StreamState::LineRate;
                return;
            }

            // Stay current with the leader's watermarks, then loop.
            if let Some(Some((event, span))) = self.rx.recv().now_or_never() {
                self.drain_leader_events(event, span);
            }
        }
    }

    /// Caught up enough to ride the live replication feed.
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.last_log_index
    }
}
