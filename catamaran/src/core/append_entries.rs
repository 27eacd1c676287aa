//! The replication receive path: Append for voters, Sync for passives.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::ServerCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::ServerResult;
use crate::network::Transport;
use crate::protocol::AppendRequest;
use crate::protocol::AppendResponse;
use crate::protocol::SyncRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: Transport<D>> ServerCore<D, R, N> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_request(&mut self, msg: AppendRequest<D>) -> ServerResult<AppendResponse> {
        self.handle_replication(msg.term, msg.leader, msg.prev_log_id, msg.entries, msg.commit_index, msg.global_index)
            .await
    }

    /// The relaxed replication RPC for passive members. Mechanically the
    /// same receive path; passives simply never turn the contact into
    /// votes or elections.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_sync_request(&mut self, msg: SyncRequest<D>) -> ServerResult<AppendResponse> {
        self.handle_replication(msg.term, msg.leader, msg.prev_log_id, msg.entries, msg.commit_index, msg.global_index)
            .await
    }

    async fn handle_replication(
        &mut self,
        term: u64,
        leader: NodeId,
        prev_log_id: LogId,
        entries: Vec<Arc<Entry<D>>>,
        commit_index: u64,
        global_index: u64,
    ) -> ServerResult<AppendResponse> {
        // A stale leader gets our term and nothing else.
        if term < self.current_term {
            tracing::debug!({ term, current = self.current_term }, "replication request term is behind");
            return Ok(AppendResponse {
                term: self.current_term,
                success: false,
                conflict: None,
            });
        }

        // Valid contact from the current leader.
        self.update_next_election_timeout();
        let mut report = false;

        if term > self.current_term {
            self.update_current_term(term, None);
            self.save_hard_state()?;
            report = true;
        }
        if self.current_leader != Some(leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(leader));
            report = true;
        }
        if self.target_state.is_leader() || self.target_state.is_candidate() {
            self.set_target_state(State::Follower);
            report = true;
        }

        // Log consistency check. The committed prefix is identical on every
        // server (and may contain compaction holes), so anything at or
        // below our commit index is consistent by construction.
        let consistent = prev_log_id.index == 0
            || prev_log_id == self.last_log_id
            || prev_log_id.index <= self.commit_index
            || self.log.term_of(prev_log_id.index) == Some(prev_log_id.term);

        if !consistent {
            let conflict = if self.last_log_id.index < prev_log_id.index {
                // We are simply behind: resume from our end of log.
                self.last_log_id
            } else {
                // Divergent suffix: back the leader off to our last known
                // agreement point, the commit index.
                LogId {
                    term: self.log.term_of(self.commit_index).unwrap_or(0),
                    index: self.commit_index,
                }
            };
            tracing::debug!(%prev_log_id, %conflict, "log consistency check failed");
            if report {
                self.report_metrics(Update::Ignore);
            }
            return Ok(AppendResponse {
                term: self.current_term,
                success: false,
                conflict: Some(conflict),
            });
        }

        if !entries.is_empty() {
            self.append_log_entries(&entries).await?;
        }

        // Only ever advance the commit index within what we actually hold.
        let commit = commit_index.min(self.last_log_id.index);
        let global = global_index.min(commit);
        self.advance_watermarks(commit, global, HashMap::new())?;

        if report {
            self.report_metrics(Update::Ignore);
        }
        Ok(AppendResponse {
            term: self.current_term,
            success: true,
            conflict: None,
        })
    }

    /// Store replicated entries, truncating a divergent suffix first.
    ///
    /// Configuration entries take effect as soon as they are stored, not
    /// when they commit.
    async fn append_log_entries(&mut self, entries: &[Arc<Entry<D>>]) -> ServerResult<()> {
        // Find the first stored entry conflicting with the payload.
        let mut conflict_at = None;
        for entry in entries {
            let index = entry.log_id.index;
            if index > self.last_log_id.index {
                break;
            }
            if let Some(term) = self.log.term_of(index) {
                if term != entry.log_id.term {
                    conflict_at = Some(index);
                    break;
                }
            }
        }

        if let Some(index) = conflict_at {
            if index <= self.commit_index {
                return Err(crate::error::ServerError::IllegalState(format!(
                    "leader replaced committed entry at index {}",
                    index
                )));
            }
            tracing::info!(from = index, "truncating divergent log suffix");
            self.log.truncate(index - 1).map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = self.log.last_log_id();

            // An uncommitted Configuration entry may have been truncated
            // away; fall back to the latest one still in the log.
            let rolled_back = match self.log.latest_configuration().map_err(|err| self.map_fatal_storage_error(err))? {
                Some((version, _)) => version < self.membership.version,
                None => self.membership.version > 0,
            };
            if rolled_back {
                if let Some((version, config)) =
                    self.log.latest_configuration().map_err(|err| self.map_fatal_storage_error(err))?
                {
                    tracing::info!(version, "reverting membership to the last stored configuration");
                    self.membership = config.to_membership(version);
                }
            }
        }

        self.log.append_entries(entries).map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = self.log.last_log_id();

        // Adopt the most recent configuration carried in the payload.
        let last_config = entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Configuration(config) => Some((entry.log_id.index, config)),
                _ => None,
            })
            .last();
        if let Some((index, config)) = last_config {
            tracing::debug!(version = index, "adopting replicated membership configuration");
            self.update_membership(config.to_membership(index));
        }

        self.report_metrics(Update::Ignore);
        Ok(())
    }
}
