use virtraft_core::{
    AppendEntries, AppendEntriesResponse, Callbacks, Engine, EngineInit, Entry, EntryId, Index,
    Member, NodeId, ProposalReceipt, ProposalRejection, RequestVote, RequestVoteResponse, Result,
    Role, Term,
};

use crate::{FsmKind, Node};

/// Engine whose state is set directly by tests.
pub(crate) struct StubEngine {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub log: Vec<Entry>,
    pub commit: Index,
    pub applied: Index,
    pub members: Vec<Member>,
}

impl StubEngine {
    pub fn with_log(id: NodeId, entries: &[(Term, EntryId)]) -> Self {
        let mut engine = Self::new(EngineInit::new(id, vec![], 0));
        for (term, entry_id) in entries {
            let mut entry = Entry::normal(*entry_id, vec![]);
            entry.term = *term;
            engine.log.push(entry);
        }
        engine
    }

    pub fn leading(mut self, term: Term) -> Self {
        self.role = Role::Leader;
        self.term = term;
        self
    }

    /// Set the configuration to the given voters.
    pub fn voters(mut self, ids: &[NodeId]) -> Self {
        self.members = ids.iter().copied().map(Member::voting).collect();
        self
    }

    pub fn committed(mut self, index: Index) -> Self {
        self.commit = index;
        self.applied = index;
        self
    }
}

impl Engine for StubEngine {
    fn new(init: EngineInit) -> Self {
        Self {
            id: init.id,
            role: Role::Follower,
            term: 0,
            log: Vec::new(),
            commit: 0,
            applied: 0,
            members: init.members,
        }
    }

    fn id(&self) -> NodeId {
        self.id
    }

    fn tick(&mut self, _elapsed_ms: u64, _cb: &mut dyn Callbacks) -> Result<()> {
        Ok(())
    }

    fn propose(&mut self, _entry: Entry, _cb: &mut dyn Callbacks) -> Result<ProposalReceipt> {
        Err(ProposalRejection::NotLeader.into())
    }

    fn recv_request_vote(
        &mut self,
        _from: NodeId,
        _req: RequestVote,
        _cb: &mut dyn Callbacks,
    ) -> Result<RequestVoteResponse> {
        Ok(RequestVoteResponse {
            term: self.term,
            vote_granted: false,
        })
    }

    fn recv_request_vote_response(
        &mut self,
        _from: NodeId,
        _resp: RequestVoteResponse,
        _cb: &mut dyn Callbacks,
    ) -> Result<()> {
        Ok(())
    }

    fn recv_append_entries(
        &mut self,
        _from: NodeId,
        _req: AppendEntries,
        _cb: &mut dyn Callbacks,
    ) -> Result<AppendEntriesResponse> {
        Ok(AppendEntriesResponse {
            term: self.term,
            success: false,
            current_index: self.log.len() as Index,
        })
    }

    fn recv_append_entries_response(
        &mut self,
        _from: NodeId,
        _resp: AppendEntriesResponse,
        _cb: &mut dyn Callbacks,
    ) -> Result<()> {
        Ok(())
    }

    fn role(&self) -> Role {
        self.role
    }

    fn current_term(&self) -> Term {
        self.term
    }

    fn voted_for(&self) -> Option<NodeId> {
        None
    }

    fn leader_id(&self) -> Option<NodeId> {
        None
    }

    fn commit_index(&self) -> Index {
        self.commit
    }

    fn last_applied_index(&self) -> Index {
        self.applied
    }

    fn current_index(&self) -> Index {
        self.log.len() as Index
    }

    fn log_count(&self) -> usize {
        self.log.len()
    }

    fn entry_at(&self, index: Index) -> Option<&Entry> {
        index
            .checked_sub(1)
            .and_then(|i| self.log.get(i as usize))
    }

    fn members(&self) -> Vec<Member> {
        self.members.clone()
    }

    fn is_voting(&self) -> bool {
        true
    }
}

/// `count` connected voting nodes with ids equal to their slots.
pub(crate) fn connected_nodes(count: usize) -> Vec<Node> {
    (0..count)
        .map(|slot| {
            let mut node = Node::new(slot, slot as NodeId, FsmKind::Accumulator.build(4));
            node.advance();
            node.advance();
            node.voting = true;
            node
        })
        .collect()
}
