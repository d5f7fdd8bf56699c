use serde::Serialize;

use crate::{
    AppendEntries, AppendEntriesResponse, Entry, EntryId, Index, Message, NodeId, RequestVote,
    RequestVoteResponse, Result, Term,
};

/// Protocol role of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A configuration member as seen by one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Member {
    pub id: NodeId,
    pub voting: bool,
}

impl Member {
    pub fn voting(id: NodeId) -> Self {
        Self { id, voting: true }
    }

    pub fn non_voting(id: NodeId) -> Self {
        Self { id, voting: false }
    }
}

/// Engine timers in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timeouts {
    /// Base election timeout, engines randomize within `[election, 2 * election)`
    pub election_ms: u64,
    /// Heartbeat interval of a leader
    pub request_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            election_ms: 500,
            request_ms: 200,
        }
    }
}

/// Everything an engine needs to start.
#[derive(Debug, Clone)]
pub struct EngineInit {
    pub id: NodeId,
    /// Base configuration, the replica itself included
    pub members: Vec<Member>,
    /// Seed of the engine-private generator
    pub seed: u64,
    pub timeouts: Timeouts,
    /// Upper bound on entries carried by one AppendEntries
    pub max_append_entries: usize,
}

impl EngineInit {
    pub fn new(id: NodeId, members: Vec<Member>, seed: u64) -> Self {
        Self {
            id,
            members,
            seed,
            timeouts: Timeouts::default(),
            max_append_entries: 64,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_append_entries(mut self, max: usize) -> Self {
        self.max_append_entries = max.max(1);
        self
    }
}

/// Outcome of [`Callbacks::apply_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    /// The replica applied its own removal and must stop
    Shutdown,
}

/// Where an accepted proposal landed in the leader's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalReceipt {
    pub index: Index,
    pub term: Term,
    pub id: EntryId,
}

/// Hooks an engine calls while it runs.
///
/// All calls are synchronous and happen inside an engine entrypoint. Implementations must
/// not call back into the engine.
pub trait Callbacks {
    /// Hand a message to the network. Returns whether at least one copy was enqueued.
    fn send(&mut self, to: NodeId, message: Message) -> bool;

    /// A committed entry is applied, in log order.
    fn apply_entry(&mut self, index: Index, entry: &Entry) -> ApplyStatus;

    fn persist_term(&mut self, term: Term);

    fn persist_vote(&mut self, vote: Option<NodeId>);

    /// An entry was appended to the log, not committed yet.
    fn log_offer(&mut self, entry: &Entry, index: Index);

    /// An entry was removed from the front of the log (compaction).
    fn log_poll(&mut self, entry: &Entry, index: Index);

    /// An entry was removed from the back of the log while resolving a conflict.
    fn log_pop(&mut self, entry: &Entry, index: Index);

    /// A non-voting member caught up with the leader's log.
    fn node_has_sufficient_logs(&mut self, node: NodeId);

    fn debug_log(&mut self, message: &str);
}

/// A consensus engine driven step by step by the harness.
pub trait Engine {
    fn new(init: EngineInit) -> Self
    where
        Self: Sized;

    fn id(&self) -> NodeId;

    /// Advance timers by `elapsed_ms`, possibly starting an election or sending heartbeats.
    fn tick(&mut self, elapsed_ms: u64, cb: &mut dyn Callbacks) -> Result<()>;

    /// Append an entry to the leader's log and start replicating it.
    fn propose(&mut self, entry: Entry, cb: &mut dyn Callbacks) -> Result<ProposalReceipt>;

    fn recv_request_vote(
        &mut self,
        from: NodeId,
        req: RequestVote,
        cb: &mut dyn Callbacks,
    ) -> Result<RequestVoteResponse>;

    fn recv_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
        cb: &mut dyn Callbacks,
    ) -> Result<()>;

    fn recv_append_entries(
        &mut self,
        from: NodeId,
        req: AppendEntries,
        cb: &mut dyn Callbacks,
    ) -> Result<AppendEntriesResponse>;

    fn recv_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
        cb: &mut dyn Callbacks,
    ) -> Result<()>;

    fn role(&self) -> Role;

    fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    fn current_term(&self) -> Term;

    fn voted_for(&self) -> Option<NodeId>;

    fn leader_id(&self) -> Option<NodeId>;

    fn commit_index(&self) -> Index;

    fn last_applied_index(&self) -> Index;

    /// Index of the last entry in the log.
    fn current_index(&self) -> Index;

    fn log_count(&self) -> usize;

    fn entry_at(&self, index: Index) -> Option<&Entry>;

    /// Current configuration, ordered by id.
    fn members(&self) -> Vec<Member>;

    /// Whether this replica holds voting rights in its own configuration.
    fn is_voting(&self) -> bool;
}
