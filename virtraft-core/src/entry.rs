use serde::Serialize;

use crate::{EngineError, EntryId, NodeId, Term};

/// Type tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EntryKind {
    /// Application command for the replica state machines
    Normal,
    /// Add a member that receives replication but does not vote
    AddNonVoting,
    /// Promote a non-voting member to a voter
    AddVoting,
    /// Take voting rights away from a member
    Demote,
    /// Drop a member from the configuration
    Remove,
}

impl EntryKind {
    pub fn is_config_change(&self) -> bool {
        !matches!(self, Self::Normal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::AddNonVoting => "add_nonvoting",
            Self::AddVoting => "add_voting",
            Self::Demote => "demote",
            Self::Remove => "remove",
        }
    }
}

/// Payload of a cfg-change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub struct ConfigChange {
    pub node_id: NodeId,
}

impl ConfigChange {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    pub fn encode(&self) -> Vec<u8> {
        bitcode::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        bitcode::decode(bytes).map_err(|e| EngineError::Codec(e.to_string()))
    }
}

/// A replicated log entry.
///
/// `term` is stamped by the leader when the entry is proposed, `id` by the harness when the
/// entry is created. Two entries are the same entry when both match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub term: Term,
    pub id: EntryId,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl Entry {
    /// Create an application entry carrying an encoded command.
    pub fn normal(id: EntryId, data: Vec<u8>) -> Self {
        Self {
            term: 0,
            id,
            kind: EntryKind::Normal,
            data,
        }
    }

    /// Create a cfg-change entry targeting `node_id`.
    ///
    /// `kind` should be one of the cfg-change kinds; a `Normal` kind yields an entry the
    /// state machines will fail to decode.
    pub fn config_change(id: EntryId, kind: EntryKind, node_id: NodeId) -> Self {
        Self {
            term: 0,
            id,
            kind,
            data: ConfigChange::new(node_id).encode(),
        }
    }

    pub fn is_config_change(&self) -> bool {
        self.kind.is_config_change()
    }

    /// Decode the cfg-change payload, `None` for normal entries.
    pub fn change(&self) -> Option<Result<ConfigChange, EngineError>> {
        if self.is_config_change() {
            Some(ConfigChange::decode(&self.data))
        } else {
            None
        }
    }

    /// Target of a cfg-change entry, `None` for normal entries or undecodable payloads.
    pub fn target(&self) -> Option<NodeId> {
        match self.change() {
            Some(Ok(change)) => Some(change.node_id),
            _ => None,
        }
    }

    /// Whether both entries carry the same `{term, id}`.
    pub fn same_as(&self, other: &Entry) -> bool {
        self.term == other.term && self.id == other.id
    }
}
