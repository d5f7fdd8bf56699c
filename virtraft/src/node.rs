use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;
use virtraft_core::{EntryId, NodeId, Term};

use crate::{Envelope, StateMachine};

/// Status changes kept per slot.
const HISTORY_LIMIT: usize = 16;

/// Membership lifecycle of a replica slot.
///
/// Forward order is Disconnected, Connecting, Connected, Disconnecting and back to
/// Disconnected. Only a popped cfg entry may step back, and only by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectStatus {
    pub fn next(self) -> Self {
        match self {
            Self::Disconnected => Self::Connecting,
            Self::Connecting => Self::Connected,
            Self::Connected => Self::Disconnecting,
            Self::Disconnecting => Self::Disconnected,
        }
    }

    /// Status restored when the change that led here is undone.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::Disconnected),
            Self::Disconnecting => Some(Self::Connected),
            _ => None,
        }
    }

    /// Active replicas exchange messages and run timers.
    pub fn is_active(self) -> bool {
        self != Self::Disconnected
    }

    pub fn in_transition(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from: ConnectStatus,
    pub to: ConnectStatus,
    pub rollback: bool,
}

impl StatusChange {
    pub fn is_legal(&self) -> bool {
        if self.rollback {
            self.from.previous() == Some(self.to)
        } else {
            self.from.next() == self.to
        }
    }
}

/// One replica slot. Slots are recycled in place, never destroyed.
#[derive(Debug)]
pub struct Node {
    pub slot: usize,
    pub id: NodeId,
    status: ConnectStatus,
    pub inbox: VecDeque<Envelope>,
    pub fsm: Box<dyn StateMachine>,
    /// Entries offered to this replica's log since the slot was created.
    pub offers: u64,
    pub voting: bool,
    pub partitioned: bool,
    pub persisted_term: Term,
    pub persisted_vote: Option<NodeId>,
    /// Cfg entry driving the current transition, only its pop may undo it.
    pub(crate) transition: Option<EntryId>,
    history: VecDeque<StatusChange>,
    changes: u64,
}

impl Node {
    pub(crate) fn new(slot: usize, id: NodeId, fsm: Box<dyn StateMachine>) -> Self {
        Self {
            slot,
            id,
            status: ConnectStatus::Disconnected,
            inbox: VecDeque::new(),
            fsm,
            offers: 0,
            voting: false,
            partitioned: false,
            persisted_term: 0,
            persisted_vote: None,
            transition: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            changes: 0,
        }
    }

    pub fn status(&self) -> ConnectStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// The most recent status changes of this slot, oldest first.
    pub fn history(&self) -> &VecDeque<StatusChange> {
        &self.history
    }

    /// Number of status changes since the slot was created, including those no longer in
    /// [`Node::history`].
    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub(crate) fn advance(&mut self) -> ConnectStatus {
        let to = self.status.next();
        self.record(to, false);
        to
    }

    pub(crate) fn rollback(&mut self) -> Option<ConnectStatus> {
        let to = self.status.previous()?;
        self.record(to, true);
        Some(to)
    }

    /// Walk forward until Disconnected.
    pub(crate) fn retire(&mut self) {
        while self.status.is_active() {
            self.advance();
        }
    }

    pub(crate) fn reset_persisted(&mut self) {
        self.persisted_term = 0;
        self.persisted_vote = None;
    }

    fn record(&mut self, to: ConnectStatus, rollback: bool) {
        let change = StatusChange {
            from: self.status,
            to,
            rollback,
        };
        debug_assert!(change.is_legal(), "illegal status change {change:?}");

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(change);
        self.changes += 1;
        self.status = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsmKind;

    fn node() -> Node {
        Node::new(0, 0, FsmKind::Accumulator.build(1))
    }

    #[test]
    fn test_forward_cycle() {
        let mut node = node();
        assert_eq!(node.advance(), ConnectStatus::Connecting);
        assert_eq!(node.advance(), ConnectStatus::Connected);
        assert_eq!(node.advance(), ConnectStatus::Disconnecting);
        assert_eq!(node.advance(), ConnectStatus::Disconnected);
        assert!(node.history().iter().all(StatusChange::is_legal));
    }

    #[test]
    fn test_rollback_only_from_transitions() {
        let mut node = node();
        assert_eq!(node.rollback(), None);

        node.advance();
        assert_eq!(node.rollback(), Some(ConnectStatus::Disconnected));

        node.advance();
        node.advance();
        assert_eq!(node.rollback(), None);
        node.advance();
        assert_eq!(node.rollback(), Some(ConnectStatus::Connected));
        assert!(node.history().iter().all(StatusChange::is_legal));
        assert_eq!(node.history().iter().filter(|c| c.rollback).count(), 2);
    }

    #[test]
    fn test_retire_walks_forward() {
        let mut node = node();
        node.advance();
        node.advance();
        node.retire();

        assert_eq!(node.status(), ConnectStatus::Disconnected);
        let path: Vec<_> = node.history().iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![
                ConnectStatus::Connecting,
                ConnectStatus::Connected,
                ConnectStatus::Disconnecting,
                ConnectStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut node = node();
        for _ in 0..10 {
            node.advance();
            node.advance();
            node.retire();
        }

        assert_eq!(node.changes(), 40);
        assert_eq!(node.history().len(), HISTORY_LIMIT);
        assert_eq!(node.history().back().map(|c| c.to), Some(ConnectStatus::Disconnected));
        assert!(node.history().iter().all(StatusChange::is_legal));
    }

    #[test]
    fn test_skip_is_illegal() {
        let change = StatusChange {
            from: ConnectStatus::Disconnected,
            to: ConnectStatus::Connected,
            rollback: false,
        };
        assert!(!change.is_legal());
    }
}
