use std::collections::{BTreeMap, BTreeSet};

use virtraft_core::{
    AppendEntries, AppendEntriesResponse, ApplyStatus, Callbacks, Engine, EngineError,
    EngineInit, Entry, Index, Member, NodeId, ProposalReceipt, ProposalRejection, RequestVote,
    RequestVoteResponse, Result, Role, SimRng, Term, Timeouts,
};

use crate::{Log, Membership};

/// Replication state the leader keeps per peer.
#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: Index,
    match_index: Index,
}

/// Single-server-change Raft.
pub struct RaftEngine {
    id: NodeId,
    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Log,
    membership: Membership,
    commit_index: Index,
    last_applied: Index,
    progress: BTreeMap<NodeId, Progress>,
    votes: BTreeSet<NodeId>,
    elapsed_ms: u64,
    election_timeout_ms: u64,
    timeouts: Timeouts,
    max_append_entries: usize,
    rng: SimRng,
    shutdown: bool,
}

impl RaftEngine {
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn reset_election_timer(&mut self) {
        self.elapsed_ms = 0;
        self.election_timeout_ms =
            self.timeouts.election_ms + self.rng.below(self.timeouts.election_ms);
    }

    fn step_down(&mut self, term: Term, cb: &mut dyn Callbacks) {
        if term > self.term {
            self.term = term;
            cb.persist_term(term);
            self.voted_for = None;
            cb.persist_vote(None);
            self.leader_id = None;
        }
        if self.role != Role::Follower {
            cb.debug_log(&format!("{} stepping down in term {}", self.id, self.term));
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.progress.clear();
    }

    fn start_election(&mut self, cb: &mut dyn Callbacks) {
        self.term += 1;
        cb.persist_term(self.term);
        self.voted_for = Some(self.id);
        cb.persist_vote(self.voted_for);
        self.role = Role::Candidate;
        self.leader_id = None;
        self.progress.clear();
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timer();
        cb.debug_log(&format!("{} starting election for term {}", self.id, self.term));

        if self.has_vote_quorum() {
            self.become_leader(cb);
            return;
        }

        let req = RequestVote {
            term: self.term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let voters: Vec<NodeId> = self.membership.voters().filter(|v| *v != self.id).collect();
        for voter in voters {
            cb.send(voter, req.clone().into());
        }
    }

    fn has_vote_quorum(&self) -> bool {
        let granted = self
            .votes
            .iter()
            .filter(|v| self.membership.is_voting(**v))
            .count();
        granted >= self.membership.quorum()
    }

    fn become_leader(&mut self, cb: &mut dyn Callbacks) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.elapsed_ms = 0;

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .membership
            .ids()
            .filter(|id| *id != self.id)
            .map(|id| {
                (
                    id,
                    Progress {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();

        cb.debug_log(&format!("{} became leader for term {}", self.id, self.term));
        self.broadcast_append_entries(cb);
    }

    /// Keep one progress record per peer in the current configuration.
    fn sync_progress(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let peers: BTreeSet<NodeId> = self.membership.ids().filter(|id| *id != self.id).collect();
        self.progress.retain(|id, _| peers.contains(id));
        for peer in peers {
            self.progress.entry(peer).or_insert(Progress {
                next_index: 1,
                match_index: 0,
            });
        }
    }

    fn send_append_entries(&mut self, to: NodeId, cb: &mut dyn Callbacks) {
        let Some(progress) = self.progress.get(&to).copied() else {
            return;
        };
        let prev_log_index = progress.next_index.saturating_sub(1);
        let req = AppendEntries {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            leader_commit: self.commit_index,
            entries: self
                .log
                .entries_from(progress.next_index, self.max_append_entries),
        };
        cb.send(to, req.into());
    }

    fn broadcast_append_entries(&mut self, cb: &mut dyn Callbacks) {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append_entries(peer, cb);
        }
    }

    fn append(&mut self, entry: Entry, cb: &mut dyn Callbacks) -> Index {
        self.membership.apply(&entry);
        let index = self.log.append(entry);
        if let Some(entry) = self.log.get(index) {
            cb.log_offer(entry, index);
        }
        index
    }

    fn truncate_from(&mut self, index: Index, cb: &mut dyn Callbacks) {
        if index <= self.commit_index {
            tracing::warn!(
                node = self.id,
                index,
                commit = self.commit_index,
                "truncating below the commit index"
            );
        }
        let popped = self.log.truncate_from(index);
        for (at, entry) in &popped {
            cb.log_pop(entry, *at);
        }
        if popped.iter().any(|(_, e)| e.is_config_change()) {
            self.membership.rebuild(&self.log);
        }
    }

    fn has_pending_config_change(&self) -> bool {
        self.log
            .iter()
            .skip(self.commit_index as usize)
            .any(|(_, e)| e.is_config_change())
    }

    /// Commit the highest current-term index replicated on a quorum of voters.
    fn advance_commit_index(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let quorum = self.membership.quorum();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term_at(n) != Some(self.term) {
                break;
            }
            let own = usize::from(self.membership.is_voting(self.id));
            let replicated = self
                .progress
                .iter()
                .filter(|(id, p)| p.match_index >= n && self.membership.is_voting(**id))
                .count();
            if own + replicated >= quorum {
                self.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    fn apply_committed(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                tracing::warn!(node = self.id, index, "committed entry missing from log");
                break;
            };
            self.last_applied = index;
            if cb.apply_entry(index, &entry) == ApplyStatus::Shutdown {
                self.shutdown = true;
                cb.debug_log(&format!("{} shutting down after applying {index}", self.id));
                return Err(EngineError::Shutdown);
            }
        }
        Ok(())
    }
}

impl Engine for RaftEngine {
    fn new(init: EngineInit) -> Self {
        let mut engine = Self {
            id: init.id,
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            log: Log::new(),
            membership: Membership::new(&init.members),
            commit_index: 0,
            last_applied: 0,
            progress: BTreeMap::new(),
            votes: BTreeSet::new(),
            elapsed_ms: 0,
            election_timeout_ms: init.timeouts.election_ms,
            timeouts: init.timeouts,
            max_append_entries: init.max_append_entries.max(1),
            rng: SimRng::new(init.seed),
            shutdown: false,
        };
        engine.reset_election_timer();
        engine
    }

    fn id(&self) -> NodeId {
        self.id
    }

    fn tick(&mut self, elapsed_ms: u64, cb: &mut dyn Callbacks) -> Result<()> {
        self.ensure_running()?;
        self.elapsed_ms += elapsed_ms;

        if self.role == Role::Leader {
            if self.elapsed_ms >= self.timeouts.request_ms {
                self.elapsed_ms = 0;
                self.broadcast_append_entries(cb);
            }
        } else if self.elapsed_ms >= self.election_timeout_ms {
            // non-voting members never campaign
            if self.membership.is_voting(self.id) {
                self.start_election(cb);
            } else {
                self.reset_election_timer();
            }
        }

        self.apply_committed(cb)
    }

    fn propose(&mut self, mut entry: Entry, cb: &mut dyn Callbacks) -> Result<ProposalReceipt> {
        self.ensure_running()?;
        if self.role != Role::Leader {
            return Err(ProposalRejection::NotLeader.into());
        }

        if entry.is_config_change() {
            if self.has_pending_config_change() {
                return Err(ProposalRejection::ConfigChangeInFlight.into());
            }
            if self.log.term_at(self.commit_index) != Some(self.term) {
                return Err(ProposalRejection::LeaderNotReady.into());
            }
            if !self.membership.admits(&entry) {
                return Err(ProposalRejection::InvalidConfigChange.into());
            }
        }

        entry.term = self.term;
        let id = entry.id;
        let index = self.append(entry, cb);
        self.sync_progress();
        self.advance_commit_index();
        self.broadcast_append_entries(cb);
        self.apply_committed(cb)?;

        Ok(ProposalReceipt {
            index,
            term: self.term,
            id,
        })
    }

    fn recv_request_vote(
        &mut self,
        from: NodeId,
        req: RequestVote,
        cb: &mut dyn Callbacks,
    ) -> Result<RequestVoteResponse> {
        self.ensure_running()?;
        if req.term > self.term {
            self.step_down(req.term, cb);
        }

        let up_to_date = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        let free = self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
        let vote_granted = req.term == self.term && free && up_to_date;

        if vote_granted {
            self.voted_for = Some(req.candidate_id);
            cb.persist_vote(self.voted_for);
            self.reset_election_timer();
            cb.debug_log(&format!(
                "{} granted vote to {from} in term {}",
                self.id, self.term
            ));
        }

        Ok(RequestVoteResponse {
            term: self.term,
            vote_granted,
        })
    }

    fn recv_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        self.ensure_running()?;
        if resp.term > self.term {
            self.step_down(resp.term, cb);
            return Ok(());
        }
        if self.role != Role::Candidate || resp.term != self.term || !resp.vote_granted {
            return Ok(());
        }

        self.votes.insert(from);
        if self.has_vote_quorum() {
            self.become_leader(cb);
        }
        Ok(())
    }

    fn recv_append_entries(
        &mut self,
        _from: NodeId,
        req: AppendEntries,
        cb: &mut dyn Callbacks,
    ) -> Result<AppendEntriesResponse> {
        self.ensure_running()?;
        if req.term < self.term {
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                current_index: self.log.last_index(),
            });
        }

        if req.term > self.term || self.role != Role::Follower {
            self.step_down(req.term, cb);
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_timer();

        if req.prev_log_index > self.log.last_index() {
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                current_index: self.log.last_index(),
            });
        }
        if self.log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                current_index: req.prev_log_index - 1,
            });
        }

        let last_new = req.prev_log_index + req.entries.len() as Index;
        let mut index = req.prev_log_index;
        for entry in req.entries {
            index += 1;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    cb.debug_log(&format!("{} conflict at {index}, truncating", self.id));
                    self.truncate_from(index, cb);
                    self.append(entry, cb);
                }
                None => {
                    self.append(entry, cb);
                }
            }
        }

        let commit = req.leader_commit.min(last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
        }
        self.apply_committed(cb)?;

        Ok(AppendEntriesResponse {
            term: self.term,
            success: true,
            current_index: last_new,
        })
    }

    fn recv_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        self.ensure_running()?;
        if resp.term > self.term {
            self.step_down(resp.term, cb);
            return Ok(());
        }
        if self.role != Role::Leader || resp.term != self.term {
            return Ok(());
        }

        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };

        if !resp.success {
            let hinted = resp.current_index + 1;
            progress.next_index = progress
                .next_index
                .saturating_sub(1)
                .min(hinted)
                .max(progress.match_index + 1);
            self.send_append_entries(from, cb);
            return Ok(());
        }

        if resp.current_index > progress.match_index {
            progress.match_index = resp.current_index.min(last_index);
        }
        if progress.next_index <= progress.match_index {
            progress.next_index = progress.match_index + 1;
        }
        let match_index = progress.match_index;
        let next_index = progress.next_index;

        if self.membership.contains(from)
            && !self.membership.is_voting(from)
            && !self.has_pending_config_change()
            && last_index <= match_index + 1
        {
            cb.node_has_sufficient_logs(from);
        }

        if self.advance_commit_index() {
            self.apply_committed(cb)?;
        }
        if next_index <= self.log.last_index() {
            self.send_append_entries(from, cb);
        }
        Ok(())
    }

    fn role(&self) -> Role {
        self.role
    }

    fn current_term(&self) -> Term {
        self.term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    fn commit_index(&self) -> Index {
        self.commit_index
    }

    fn last_applied_index(&self) -> Index {
        self.last_applied
    }

    fn current_index(&self) -> Index {
        self.log.last_index()
    }

    fn log_count(&self) -> usize {
        self.log.len()
    }

    fn entry_at(&self, index: Index) -> Option<&Entry> {
        self.log.get(index)
    }

    fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    fn is_voting(&self) -> bool {
        self.membership.is_voting(self.id)
    }
}
