use serde::Serialize;

use crate::{Entry, Index, NodeId, Term};

/// Vote solicitation sent by a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replication request sent by a leader. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub leader_commit: Index,
    pub entries: Vec<Entry>,
}

/// Reply to [`AppendEntries`].
///
/// On success `current_index` is the last index known to match the leader. On failure it is
/// a hint: the highest index the follower could possibly match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub current_index: Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MessageType {
    RequestVote,
    RequestVoteResponse,
    AppendEntries,
    AppendEntriesResponse,
}

/// Envelope payload carried by the virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RequestVote(_) => MessageType::RequestVote,
            Self::RequestVoteResponse(_) => MessageType::RequestVoteResponse,
            Self::AppendEntries(_) => MessageType::AppendEntries,
            Self::AppendEntriesResponse(_) => MessageType::AppendEntriesResponse,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            Self::RequestVote(m) => m.term,
            Self::RequestVoteResponse(m) => m.term,
            Self::AppendEntries(m) => m.term,
            Self::AppendEntriesResponse(m) => m.term,
        }
    }

    /// Number of log entries carried, only AppendEntries carries any.
    pub fn batch_size(&self) -> usize {
        match self {
            Self::AppendEntries(m) => m.entries.len(),
            _ => 0,
        }
    }
}

impl From<RequestVote> for Message {
    fn from(value: RequestVote) -> Self {
        Self::RequestVote(value)
    }
}

impl From<RequestVoteResponse> for Message {
    fn from(value: RequestVoteResponse) -> Self {
        Self::RequestVoteResponse(value)
    }
}

impl From<AppendEntries> for Message {
    fn from(value: AppendEntries) -> Self {
        Self::AppendEntries(value)
    }
}

impl From<AppendEntriesResponse> for Message {
    fn from(value: AppendEntriesResponse) -> Self {
        Self::AppendEntriesResponse(value)
    }
}
