//! Vote and pre-vote handling.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::ServerCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ServerResult;
use crate::network::Transport;
use crate::protocol::PollRequest;
use crate::protocol::PollResponse;
use crate::protocol::VoteRequest;
use crate::protocol::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: Transport<D>> ServerCore<D, R, N> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) fn handle_vote_request(&mut self, msg: VoteRequest) -> ServerResult<VoteResponse> {
        if msg.term < self.current_term {
            tracing::debug!(
                { candidate = msg.candidate, term = msg.term, current = self.current_term },
                "vote request term is behind"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // A newer term unbinds any prior vote and deposes candidate or
        // leader roles.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout();
            self.save_hard_state()?;
            if self.target_state.is_leader() || self.target_state.is_candidate() {
                self.set_target_state(State::Follower);
                self.update_current_leader(UpdateCurrentLeader::Unknown);
            }
            self.report_metrics(Update::Ignore);
        }

        // Passive and joining members do not vote.
        if !self.membership.is_active(&self.id) {
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // The candidate's log must be at least as up-to-date (§5.4.1).
        let candidate_log = (msg.last_log_term, msg.last_log_index);
        let local_log = (self.last_log_id.term, self.last_log_id.index);
        if candidate_log < local_log {
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // First come, first served, one vote per term.
        match self.voted_for {
            Some(candidate) if candidate != msg.candidate => Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            }),
            _ => {
                self.set_vote(msg.term, msg.candidate)?;
                self.update_next_election_timeout();
                tracing::debug!(candidate = msg.candidate, term = msg.term, "vote granted");
                Ok(VoteResponse {
                    term: self.current_term,
                    granted: true,
                })
            }
        }
    }

    /// A pre-vote probe: answered under the vote rules, but nothing is
    /// persisted, no timer is reset, and no term is adopted.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) fn handle_poll_request(&mut self, msg: PollRequest) -> ServerResult<PollResponse> {
        if msg.term < self.current_term || !self.membership.is_active(&self.id) {
            return Ok(PollResponse {
                term: self.current_term,
                accepted: false,
            });
        }
        let candidate_log = (msg.last_log_term, msg.last_log_index);
        let local_log = (self.last_log_id.term, self.last_log_id.index);
        Ok(PollResponse {
            term: self.current_term,
            accepted: candidate_log >= local_log,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: Transport<D>> CandidateState<'a, D, R, N> {
    /// Run one pre-vote round: would a quorum of active members entertain
    /// an election at the next term? No state is disturbed either way.
    pub(super) async fn poll_round(&mut self) -> ServerResult<bool> {
        let needed = self.core.membership.quorum();
        let mut accepted = 1usize; // We would accept ourselves.
        if accepted >= needed {
            return Ok(true);
        }

        let mut pending = self.spawn_parallel_poll_requests();
        let deadline = sleep_until(self.core.get_next_election_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(false),
                Some((res, peer)) = pending.recv() => {
                    if res.term > self.core.current_term {
                        tracing::debug!(peer, term = res.term, "pre-vote found a higher term");
                        self.core.update_current_term(res.term, None);
                        self.core.save_hard_state()?;
                        self.core.set_target_state(State::Follower);
                        return Ok(false);
                    }
                    if res.accepted {
                        accepted += 1;
                        if accepted >= needed {
                            return Ok(true);
                        }
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.core.handle_common(msg).await?;
                    if !self.core.target_state.is_candidate() {
                        return Ok(false);
                    }
                }
                Some(Ok(res)) = self.core.apply_handles.next() => self.core.handle_apply_result(res),
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                    return Ok(false);
                }
            }
        }
    }

    /// Probe every active peer with a pre-vote at the prospective term.
    fn spawn_parallel_poll_requests(&self) -> mpsc::Receiver<(PollResponse, NodeId)> {
        let peers: Vec<NodeId> = self
            .core
            .membership
            .active
            .keys()
            .filter(|id| **id != self.core.id)
            .copied()
            .collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let rpc = PollRequest {
                term: self.core.current_term + 1,
                candidate: self.core.id,
                last_log_index: self.core.last_log_id.index,
                last_log_term: self.core.last_log_id.term,
            };
            let (transport, tx) = (self.core.transport.clone(), tx.clone());
            tokio::spawn(
                async move {
                    match transport.poll(peer, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((res, peer)).await;
                        }
                        Err(err) => tracing::debug!(peer, error=%err, "error sending poll request"),
                    }
                }
                .instrument(tracing::debug_span!("poll", peer)),
            );
        }
        rx
    }

    /// Build and send vote requests to all active peers.
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let peers: Vec<NodeId> = self
            .core
            .membership
            .active
            .keys()
            .filter(|id| **id != self.core.id)
            .copied()
            .collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let rpc = VoteRequest {
                term: self.core.current_term,
                candidate: self.core.id,
                last_log_index: self.core.last_log_id.index,
                last_log_term: self.core.last_log_id.term,
            };
            let (transport, tx) = (self.core.transport.clone(), tx.clone());
            tokio::spawn(
                async move {
                    match transport.vote(peer, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((res, peer)).await;
                        }
                        Err(err) => tracing::debug!(peer, error=%err, "error sending vote request"),
                    }
                }
                .instrument(tracing::debug_span!("vote", peer)),
            );
        }
        rx
    }

    /// Handle a vote response.
    pub(super) fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> ServerResult<()> {
        if res.term > self.core.current_term {
            tracing::debug!(target, term = res.term, "reverting to follower due to newer term in vote response");
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state()?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if res.granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(term = self.core.current_term, "won the election, transitioning to leader");
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }
}
