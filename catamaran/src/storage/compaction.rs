//! Two-tier incremental log compaction.
//!
//! A background task alternates minor and major passes at configured
//! intervals. Minor passes cover sealed segments wholly below the commit
//! watermark; major passes cover segments below the global watermark (the
//! index replicated to every active member) and additionally shed no-ops
//! and session bookkeeping nothing references anymore. Retention decisions
//! that depend on session or application state are answered by the state
//! machine context over a query channel, so the single-owner rule for that
//! state is preserved.
//!
//! Only one pass runs at a time and the active segment is never touched, so
//! compaction never contends with appends.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::Instant;

use crate::config::Config;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::StorageError;
pub use crate::state_machine::Compaction;
use crate::state_machine::CompactionKind;
use crate::storage::Log;
use crate::AppData;
use crate::MessageSummary;

/// The safe bounds for the two compaction tiers, published by the consensus
/// core on a watch channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionWatermarks {
    /// The commit index: the minor compaction bound.
    pub commit: u64,
    /// The global index: the major compaction bound.
    pub global: u64,
}

/// A retention question for the state machine context.
pub(crate) enum CompactionQuery<D: AppData> {
    /// What is the highest applied index? Compaction never runs ahead of it.
    Bound { tx: oneshot::Sender<u64> },
    /// Should this entry survive the given pass?
    Filter {
        entry: Entry<D>,
        compaction: Compaction,
        tx: oneshot::Sender<bool>,
    },
}

/// The background compaction task.
pub(crate) struct Compactor<D: AppData> {
    log: Arc<Log<D>>,
    queries: mpsc::UnboundedSender<CompactionQuery<D>>,
    watermarks: watch::Receiver<CompactionWatermarks>,
    minor_interval: Duration,
    major_interval: Duration,
}

impl<D: AppData> Compactor<D> {
    pub(crate) fn spawn(
        log: Arc<Log<D>>,
        queries: mpsc::UnboundedSender<CompactionQuery<D>>,
        watermarks: watch::Receiver<CompactionWatermarks>,
        config: &Config,
    ) -> JoinHandle<()> {
        let this = Self {
            log,
            queries,
            watermarks,
            minor_interval: Duration::from_millis(config.minor_compaction_interval),
            major_interval: Duration::from_millis(config.major_compaction_interval),
        };
        tokio::spawn(this.main())
    }

    async fn main(mut self) {
        let mut minor = interval_at(Instant::now() + self.minor_interval, self.minor_interval);
        let mut major = interval_at(Instant::now() + self.major_interval, self.major_interval);
        let mut closed = self.watermarks.clone();
        loop {
            tokio::select! {
                _ = minor.tick() => {
                    if let Err(err) = self.run_pass(CompactionKind::Minor).await {
                        tracing::warn!(error=%err, "minor compaction pass failed");
                    }
                }
                _ = major.tick() => {
                    if let Err(err) = self.run_pass(CompactionKind::Major).await {
                        tracing::warn!(error=%err, "major compaction pass failed");
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        tracing::debug!("watermark channel closed, compaction stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Run one compaction pass over every eligible segment.
    pub(crate) async fn run_pass(&mut self, kind: CompactionKind) -> Result<(), StorageError> {
        let marks = *self.watermarks.borrow();
        let applied = match self.applied_bound().await {
            Some(applied) => applied,
            None => return Ok(()),
        };
        let watermark = match kind {
            CompactionKind::Minor => marks.commit,
            CompactionKind::Major => marks.global,
        };
        let limit = watermark.min(applied);
        if limit == 0 {
            return Ok(());
        }

        // Every eligible segment is swept on every pass: an entry that was
        // worth keeping last time may be superseded by now, and rewrites
        // are discard-only, so repeating them is harmless.
        for first_index in self.log.compactable_segments(limit) {
            self.compact_segment(first_index, kind, limit).await?;
        }
        Ok(())
    }

    async fn compact_segment(&mut self, first_index: u64, kind: CompactionKind, limit: u64) -> Result<(), StorageError> {
        let entries = self.log.segment_entries(first_index)?;
        let compaction = Compaction { kind, index: limit };

        let mut discard = BTreeSet::new();
        for entry in entries {
            let index = entry.log_id.index;
            let keep = match &entry.payload {
                // A no-op's only purpose is committing prior entries; once
                // the whole cluster holds them it can go.
                EntryPayload::NoOp => kind == CompactionKind::Minor,
                // Queries are read-only records; applied means spent.
                EntryPayload::Query(_) => false,
                _ => self.retain(entry, compaction).await,
            };
            if !keep {
                discard.insert(index);
            }
        }

        if !discard.is_empty() {
            let discarded = self.log.rewrite_segment(first_index, &discard)?;
            tracing::info!(segment = first_index, discarded, ?kind, "compacted segment");
        }
        Ok(())
    }

    async fn applied_bound(&self) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.queries.send(CompactionQuery::Bound { tx }).ok()?;
        rx.await.ok()
    }

    /// Ask the state machine context whether to keep an entry. An
    /// unanswered question keeps the entry: dropping data is the only
    /// unsafe direction.
    async fn retain(&self, entry: Entry<D>, compaction: Compaction) -> bool {
        let summary = entry.summary();
        let (tx, rx) = oneshot::channel();
        if self.queries.send(CompactionQuery::Filter { entry, compaction, tx }).is_err() {
            return true;
        }
        match rx.await {
            Ok(keep) => {
                tracing::trace!(entry = %summary, keep, "retention decision");
                keep
            }
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::OperationEntry;

    fn command(seq: u64, op: &str) -> EntryPayload<String> {
        EntryPayload::Command(OperationEntry {
            session: 1,
            sequence: seq,
            operation: op.to_string(),
        })
    }

    /// Answer retention queries the way a state machine whose filter
    /// discards `"noop"` payloads would.
    fn spawn_responder(mut rx: mpsc::UnboundedReceiver<CompactionQuery<String>>, applied: u64) {
        tokio::spawn(async move {
            while let Some(query) = rx.recv().await {
                match query {
                    CompactionQuery::Bound { tx } => {
                        let _ = tx.send(applied);
                    }
                    CompactionQuery::Filter { entry, tx, .. } => {
                        let keep = match &entry.payload {
                            EntryPayload::Command(op) => op.operation != "noop",
                            _ => true,
                        };
                        let _ = tx.send(keep);
                    }
                }
            }
        });
    }

    fn compactor(
        log: Arc<Log<String>>,
        commit: u64,
        global: u64,
        applied: u64,
    ) -> (Compactor<String>, watch::Sender<CompactionWatermarks>) {
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        spawn_responder(query_rx, applied);
        let (marks_tx, marks_rx) = watch::channel(CompactionWatermarks { commit, global });
        let config = Config::build("compaction-ut".into())
            .minor_compaction_interval(60_000)
            .major_compaction_interval(3_600_000)
            .validate()
            .unwrap();
        let compactor = Compactor {
            log,
            queries: query_tx,
            watermarks: marks_rx,
            minor_interval: Duration::from_millis(config.minor_compaction_interval),
            major_interval: Duration::from_millis(config.major_compaction_interval),
        };
        (compactor, marks_tx)
    }

    #[tokio::test]
    async fn minor_pass_drops_filtered_commands() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::<String>::open(dir.path(), 10).unwrap());
        for i in 1..=10u64 {
            let op = if i % 2 == 0 { "noop".to_string() } else { format!("put-{}", i) };
            log.append(1, i, command(i, &op)).unwrap();
        }

        let (mut compactor, _marks) = compactor(log.clone(), 10, 0, 10);
        compactor.run_pass(CompactionKind::Minor).await.unwrap();

        for i in 1..=10u64 {
            let entry = log.get(i).unwrap();
            if i % 2 == 0 {
                assert!(entry.is_none(), "entry {} should be compacted out", i);
                assert!(!log.contains(i));
            } else {
                let entry = entry.expect("kept entry should read back");
                assert_eq!(entry.log_id.index, i);
                match entry.payload {
                    EntryPayload::Command(op) => assert_eq!(op.operation, format!("put-{}", i)),
                    _ => panic!("wrong payload"),
                }
            }
        }
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 10);
    }

    #[tokio::test]
    async fn compaction_is_bounded_by_applied_index() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::<String>::open(dir.path(), 5).unwrap());
        for i in 1..=10u64 {
            log.append(1, i, command(i, "noop")).unwrap();
        }

        // Commit says 10, but the applier has only reached 5: only the first
        // segment may be touched.
        let (mut compactor, _marks) = compactor(log.clone(), 10, 0, 5);
        compactor.run_pass(CompactionKind::Minor).await.unwrap();

        for i in 1..=5u64 {
            assert!(!log.contains(i));
        }
        for i in 6..=10u64 {
            assert!(log.contains(i), "entry {} is beyond the applied bound", i);
        }
    }

    #[tokio::test]
    async fn major_pass_discards_noops_minor_keeps_them() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::<String>::open(dir.path(), 4).unwrap());
        log.append(1, 1, EntryPayload::NoOp).unwrap();
        for i in 2..=4u64 {
            log.append(1, i, command(i, &format!("put-{}", i))).unwrap();
        }
        log.append(1, 5, command(5, "spill")).unwrap(); // rolls; seals first segment

        let (mut compactor, _marks) = compactor(log.clone(), 5, 4, 5);
        compactor.run_pass(CompactionKind::Minor).await.unwrap();
        assert!(log.contains(1), "minor keeps no-ops");

        compactor.run_pass(CompactionKind::Major).await.unwrap();
        assert!(!log.contains(1), "major sheds no-ops");
        assert!(log.contains(2));
    }

    #[tokio::test]
    async fn reopened_log_still_reads_around_holes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = Arc::new(Log::<String>::open(dir.path(), 4).unwrap());
            for i in 1..=4u64 {
                let op = if i == 2 { "noop".to_string() } else { format!("put-{}", i) };
                log.append(1, i, command(i, &op)).unwrap();
            }
            let (mut compactor, _marks) = compactor(log.clone(), 4, 0, 4);
            compactor.run_pass(CompactionKind::Minor).await.unwrap();
            assert!(!log.contains(2));
        }
        let log = Log::<String>::open(dir.path(), 4).unwrap();
        assert!(!log.contains(2));
        assert!(log.contains(3));
        assert_eq!(log.last_index(), 4);
    }
}
