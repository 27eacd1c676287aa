//! Leader handling of cluster reconfiguration: Join, Leave, Promote and
//! Demote, expressed as Configuration entries.
//!
//! At most one Configuration entry may be uncommitted at any time; further
//! changes queue behind it in arrival order and are re-validated against
//! the membership that exists when their turn comes.

use crate::core::apply::ResponderTx;
use crate::core::client_ops::PendingRequest;
use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::entry::ConfigurationEntry;
use crate::entry::EntryPayload;
use crate::error::ClientError;
use crate::error::ServerResult;
use crate::membership::Member;
use crate::membership::MemberKind;
use crate::network::Transport;
use crate::protocol::DemoteRequest;
use crate::protocol::JoinRequest;
use crate::protocol::LeaveRequest;
use crate::protocol::PromoteRequest;
use crate::replication::ReplicationEvent;
pub(super) use crate::server::ConfigTx;
use crate::server::LeaveTx;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::Update;

/// One requested change to the membership.
#[derive(Debug, Clone)]
pub(crate) enum ConfigChange {
    /// Admit a new member into the passive set.
    AddPassive(Member),
    /// Move a passive member into the active set.
    Promote(Member),
    /// Move an active member into the passive set.
    Demote(Member),
    /// Remove a member from the cluster.
    Remove(NodeId),
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> LeaderState<'a, D, R, N> {
    #[tracing::instrument(level = "debug", skip(self, tx), fields(member=rpc.member.id))]
    pub(super) fn handle_join(&mut self, rpc: JoinRequest, tx: ConfigTx) -> ServerResult<()> {
        if self.core.membership.contains(&rpc.member.id) {
            let _ = tx.send(Ok(self.core.configuration_response()));
            return Ok(());
        }
        self.enqueue_change(ConfigChange::AddPassive(rpc.member), tx)
    }

    #[tracing::instrument(level = "debug", skip(self, tx), fields(member=rpc.member.id))]
    pub(super) fn handle_leave(&mut self, rpc: LeaveRequest, tx: ConfigTx) -> ServerResult<()> {
        if !self.core.membership.contains(&rpc.member.id) {
            let _ = tx.send(Ok(self.core.configuration_response()));
            return Ok(());
        }
        self.enqueue_change(ConfigChange::Remove(rpc.member.id), tx)
    }

    #[tracing::instrument(level = "debug", skip(self, tx), fields(member=rpc.member.id))]
    pub(super) fn handle_promote(&mut self, rpc: PromoteRequest, tx: ConfigTx) -> ServerResult<()> {
        if self.core.membership.is_active(&rpc.member.id) {
            let _ = tx.send(Ok(self.core.configuration_response()));
            return Ok(());
        }
        if !self.core.membership.is_passive(&rpc.member.id) {
            let _ = tx.send(Err(ClientError::IllegalRequest(format!(
                "member {} is not part of the cluster",
                rpc.member.id
            ))));
            return Ok(());
        }
        // A passive member must have caught up before it can vote.
        let caught_up = self
            .nodes
            .get(&rpc.member.id)
            .map(|node| node.matched.index >= self.core.commit_index)
            .unwrap_or(false);
        if !caught_up {
            let _ = tx.send(Err(ClientError::IllegalRequest(format!(
                "member {} has not caught up to the commit index",
                rpc.member.id
            ))));
            return Ok(());
        }
        self.enqueue_change(ConfigChange::Promote(rpc.member), tx)
    }

    #[tracing::instrument(level = "debug", skip(self, tx), fields(member=rpc.member.id))]
    pub(super) fn handle_demote(&mut self, rpc: DemoteRequest, tx: ConfigTx) -> ServerResult<()> {
        if self.core.membership.is_passive(&rpc.member.id) {
            let _ = tx.send(Ok(self.core.configuration_response()));
            return Ok(());
        }
        if !self.core.membership.is_active(&rpc.member.id) {
            let _ = tx.send(Err(ClientError::IllegalRequest(format!(
                "member {} is not part of the cluster",
                rpc.member.id
            ))));
            return Ok(());
        }
        self.enqueue_change(ConfigChange::Demote(rpc.member), tx)
    }

    /// A graceful leave of the leader itself: replicate our removal, step
    /// down when it commits.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) fn handle_begin_leave(&mut self, tx: LeaveTx) -> ServerResult<()> {
        self.core.leaving = true;
        self.core.leave_tx = Some(tx);
        if self.core.membership.all_ids().count() <= 1 {
            if let Some(tx) = self.core.leave_tx.take() {
                let _ = tx.send(Ok(()));
            }
            self.core.set_target_state(State::Shutdown);
            return Ok(());
        }
        // The response flows through `leave_tx` at the removal commit; the
        // configuration channel here is internal.
        let (config_tx, _config_rx) = tokio::sync::oneshot::channel();
        self.enqueue_change(ConfigChange::Remove(self.core.id), config_tx)
    }

    /// Queue a change, or start it right away when none is pending.
    fn enqueue_change(&mut self, change: ConfigChange, tx: ConfigTx) -> ServerResult<()> {
        if self.pending_config.is_some() {
            tracing::debug!(?change, "configuration change queued behind pending entry");
            self.config_queue.push_back((change, tx));
            return Ok(());
        }
        self.start_config_change(change, tx)
    }

    /// Append the Configuration entry for `change` and begin replication.
    fn start_config_change(&mut self, change: ConfigChange, tx: ConfigTx) -> ServerResult<()> {
        let current = &self.core.membership;
        let next_version = self.core.last_log_id.index + 1;
        let next = match &change {
            ConfigChange::AddPassive(member) if !current.contains(&member.id) => {
                current.with_member(member.clone(), MemberKind::Passive, next_version)
            }
            ConfigChange::Promote(member) if current.is_passive(&member.id) => {
                current.with_member(member.clone(), MemberKind::Active, next_version)
            }
            ConfigChange::Demote(member) if current.is_active(&member.id) => {
                current.with_member(member.clone(), MemberKind::Passive, next_version)
            }
            ConfigChange::Remove(id) if current.contains(id) => current.without_member(*id, next_version),
            _ => {
                // The queued change became moot while it waited.
                let _ = tx.send(Ok(self.core.configuration_response()));
                return self.start_next_queued_change();
            }
        };

        tracing::info!(version = next_version, ?change, "starting configuration change");
        let entry = self.core.append_entry(EntryPayload::Configuration(ConfigurationEntry {
            active: next.active.clone(),
            passive: next.passive.clone(),
        }))?;
        debug_assert_eq!(entry.log_id.index, next_version);

        self.pending_config = Some(entry.log_id.index);
        // Adopted at append time, exactly as followers adopt it when the
        // entry is stored.
        self.core.membership = next;
        self.core.report_metrics(Update::Ignore);
        self.reconcile_replication_streams();

        self.awaiting_committed.push(PendingRequest {
            entry: entry.clone(),
            tx: ResponderTx::Configuration(tx),
        });
        self.replicate(entry)
    }

    fn start_next_queued_change(&mut self) -> ServerResult<()> {
        if self.pending_config.is_some() {
            return Ok(());
        }
        if let Some((change, tx)) = self.config_queue.pop_front() {
            return self.start_config_change(change, tx);
        }
        Ok(())
    }

    /// A Configuration entry committed: release the single-change lock,
    /// follow our own role if the committed view reassigns it, and start
    /// the next queued change.
    pub(super) fn handle_configuration_committed(&mut self, index: u64) -> ServerResult<()> {
        tracing::debug!(index, "configuration entry committed");
        if self.pending_config == Some(index) {
            self.pending_config = None;
        }

        if !self.core.membership.is_active(&self.core.id) {
            if self.core.leaving && !self.core.membership.contains(&self.core.id) {
                if let Some(tx) = self.core.leave_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                self.core.set_target_state(State::Shutdown);
                return Ok(());
            }
            tracing::info!("leader is no longer an active member; stepping down");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Passive);
            return Ok(());
        }

        self.start_next_queued_change()
    }

    /// Align the replication streams with the current membership: spawn
    /// streams for new members, respawn on kind changes, and schedule
    /// removed members for shutdown once they replicate their removal.
    pub(super) fn reconcile_replication_streams(&mut self) {
        let membership = self.core.membership.clone();

        for (member, kind) in membership.peers_of(self.core.id) {
            match self.nodes.get(&member.id) {
                None => {
                    tracing::info!(target = member.id, ?kind, "spawning replication stream for new member");
                    let state = self.spawn_replication_stream(member.id, kind);
                    self.nodes.insert(member.id, state);
                }
                Some(node) if node.kind != kind => {
                    tracing::info!(target = member.id, ?kind, "member kind changed; respawning replication stream");
                    if let Some(old) = self.nodes.remove(&member.id) {
                        let _ = old.stream.tx.send((ReplicationEvent::Terminate, tracing::debug_span!("CH")));
                    }
                    let mut state = self.spawn_replication_stream(member.id, kind);
                    if let Some(old_matched) = self.leader_metrics.replication.get(&member.id) {
                        state.matched = old_matched.matched;
                    }
                    self.nodes.insert(member.id, state);
                }
                Some(_) => {}
            }
        }

        let version = membership.version;
        for (id, node) in self.nodes.iter_mut() {
            if !membership.contains(id) && node.remove_after_commit.is_none() {
                tracing::info!(target = id, "member removed; stream winds down after replicating the removal");
                node.remove_after_commit = Some(version);
            }
        }
        self.leader_report_metrics();
    }
}
