//! Engine callbacks bound to one replica slot.
//!
//! Every engine call receives a [`ReplicaContext`] borrowing the shared [`Cluster`]. Work
//! that needs another engine (proposing the next cfg step, quiescing a replica) cannot run
//! inside the callback and is queued as a [`Deferred`] action for the harness to drain.

use std::collections::VecDeque;

use virtraft_core::{ApplyStatus, Callbacks, Entry, Index, Message, NodeId, SimRng, Term};

use crate::ledger::LedgerCheck;
use crate::membership::{self, Deferred};
use crate::{CommitLedger, Node, SimStats, Violation, ViolationType, VirtualNetwork};

/// State shared by every replica of a run.
#[derive(Debug)]
pub(crate) struct Cluster {
    pub nodes: Vec<Node>,
    pub network: VirtualNetwork,
    pub ledger: CommitLedger,
    pub rng: SimRng,
    pub stats: SimStats,
    pub deferred: VecDeque<Deferred>,
    /// First violation raised from inside a callback.
    pub fatal: Option<Violation>,
}

impl Cluster {
    pub fn new(nodes: Vec<Node>, network: VirtualNetwork, rng: SimRng) -> Self {
        Self {
            nodes,
            network,
            ledger: CommitLedger::new(),
            rng,
            stats: SimStats::default(),
            deferred: VecDeque::new(),
            fatal: None,
        }
    }

    pub fn fail(&mut self, violation: Violation) {
        if self.fatal.is_none() {
            tracing::error!(%violation, "violation raised by callback");
            self.fatal = Some(violation);
        }
    }

    pub fn defer(&mut self, action: Deferred) {
        if !self.deferred.contains(&action) {
            self.deferred.push_back(action);
        }
    }

    /// Slot currently holding `id`.
    pub fn slot_of(&self, id: NodeId) -> Option<usize> {
        self.network.slot_of(id)
    }
}

/// Callback handle for the engine in `slot`.
pub(crate) struct ReplicaContext<'a> {
    slot: usize,
    id: NodeId,
    cluster: &'a mut Cluster,
}

impl<'a> ReplicaContext<'a> {
    pub fn new(slot: usize, cluster: &'a mut Cluster) -> Self {
        let id = cluster.nodes[slot].id;
        Self { slot, id, cluster }
    }
}

impl Callbacks for ReplicaContext<'_> {
    fn send(&mut self, to: NodeId, message: Message) -> bool {
        let stats = &mut self.cluster.stats;
        stats.max_batch_size = stats.max_batch_size.max(message.batch_size() as u64);

        let Cluster {
            nodes,
            network,
            rng,
            ..
        } = &mut *self.cluster;
        network.send(nodes, rng, self.id, to, message)
    }

    fn apply_entry(&mut self, index: Index, entry: &Entry) -> ApplyStatus {
        if let LedgerCheck::Diverged { recorded } =
            self.cluster.ledger.record(index, entry.term, entry.id)
        {
            self.cluster.fail(Violation::new(
                ViolationType::StateMachineSafety,
                vec![self.id],
                format!(
                    "replica {} applied (term {}, id {}) at {index} but (term {}, id {}) was \
                     committed there",
                    self.id, entry.term, entry.id, recorded.term, recorded.id
                ),
            ));
            return ApplyStatus::Applied;
        }

        let stats = &mut self.cluster.stats;
        stats.entries_applied += 1;
        stats.max_commit_index = stats.max_commit_index.max(index);

        if entry.is_config_change() {
            return membership::on_apply(self.cluster, self.slot, self.id, entry);
        }

        if let Err(err) = self.cluster.nodes[self.slot].fsm.apply(&entry.data) {
            tracing::warn!(replica = self.id, index, %err, "state machine rejected entry");
            self.cluster.stats.fsm_errors += 1;
        }
        ApplyStatus::Applied
    }

    fn persist_term(&mut self, term: Term) {
        let node = &mut self.cluster.nodes[self.slot];
        if term < node.persisted_term {
            let previous = node.persisted_term;
            self.cluster.fail(Violation::new(
                ViolationType::TermRegression,
                vec![self.id],
                format!(
                    "replica {} persisted term {term} after term {previous}",
                    self.id
                ),
            ));
            return;
        }
        node.persisted_term = term;
    }

    fn persist_vote(&mut self, vote: Option<NodeId>) {
        self.cluster.nodes[self.slot].persisted_vote = vote;
    }

    fn log_offer(&mut self, entry: &Entry, _index: Index) {
        self.cluster.nodes[self.slot].offers += 1;
        self.cluster.stats.log_offers += 1;
        if entry.is_config_change() {
            membership::on_offer(self.cluster, entry);
        }
    }

    fn log_poll(&mut self, _entry: &Entry, _index: Index) {
        self.cluster.stats.log_polls += 1;
    }

    fn log_pop(&mut self, entry: &Entry, index: Index) {
        self.cluster.stats.log_pops += 1;
        if self.cluster.ledger.is_committed(index, entry.term, entry.id) {
            self.cluster.fail(Violation::new(
                ViolationType::CommittedEntryPopped,
                vec![self.id],
                format!(
                    "replica {} removed committed entry (term {}, id {}) at {index}",
                    self.id, entry.term, entry.id
                ),
            ));
            return;
        }
        if entry.is_config_change() {
            membership::on_pop(self.cluster, entry);
        }
    }

    fn node_has_sufficient_logs(&mut self, node: NodeId) {
        membership::on_sufficient_logs(self.cluster, self.slot, node);
    }

    fn debug_log(&mut self, message: &str) {
        tracing::debug!(replica = self.id, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultConfig, FsmKind};
    use virtraft_core::EntryKind;

    fn cluster(size: usize) -> Cluster {
        let mut network = VirtualNetwork::new(FaultConfig::none());
        let nodes = (0..size)
            .map(|slot| {
                let mut node = Node::new(slot, slot as NodeId, FsmKind::Accumulator.build(4));
                node.advance();
                node.advance();
                node.voting = true;
                network.register(slot as NodeId, slot);
                node
            })
            .collect();
        Cluster::new(nodes, network, SimRng::new(7))
    }

    fn committed(id: u64, term: Term) -> Entry {
        let mut entry = Entry::normal(id, Vec::new());
        entry.term = term;
        entry
    }

    #[test]
    fn test_divergent_apply_is_fatal() {
        let mut cluster = cluster(2);

        ReplicaContext::new(0, &mut cluster).apply_entry(1, &committed(10, 1));
        assert!(cluster.fatal.is_none());

        ReplicaContext::new(1, &mut cluster).apply_entry(1, &committed(11, 1));
        let violation = cluster.fatal.take().unwrap();
        assert_eq!(violation.violation_type, ViolationType::StateMachineSafety);
        assert_eq!(violation.replicas, vec![1]);
    }

    #[test]
    fn test_term_regression_is_fatal() {
        let mut cluster = cluster(1);
        let mut ctx = ReplicaContext::new(0, &mut cluster);
        ctx.persist_term(3);
        ctx.persist_term(3);
        assert!(cluster.fatal.is_none());

        ReplicaContext::new(0, &mut cluster).persist_term(2);
        assert_eq!(
            cluster.fatal.map(|v| v.violation_type),
            Some(ViolationType::TermRegression)
        );
    }

    #[test]
    fn test_popping_committed_entry_is_fatal() {
        let mut cluster = cluster(2);
        ReplicaContext::new(0, &mut cluster).apply_entry(1, &committed(10, 1));

        // an uncommitted entry may go
        ReplicaContext::new(1, &mut cluster).log_pop(&committed(12, 1), 2);
        assert!(cluster.fatal.is_none());

        ReplicaContext::new(1, &mut cluster).log_pop(&committed(10, 1), 1);
        assert_eq!(
            cluster.fatal.map(|v| v.violation_type),
            Some(ViolationType::CommittedEntryPopped)
        );
    }

    #[test]
    fn test_bad_command_counts_fsm_error() {
        let mut cluster = cluster(1);
        let status = ReplicaContext::new(0, &mut cluster).apply_entry(1, &committed(1, 1));

        assert_eq!(status, ApplyStatus::Applied);
        assert_eq!(cluster.stats.fsm_errors, 1);
        assert_eq!(cluster.stats.entries_applied, 1);
        assert!(cluster.fatal.is_none());
    }

    #[test]
    fn test_demote_disables_voting_once_applied() {
        let mut cluster = cluster(3);
        let mut demote = Entry::config_change(5, EntryKind::Demote, 2);
        demote.term = 1;

        ReplicaContext::new(0, &mut cluster).log_offer(&demote, 4);
        assert!(cluster.nodes[2].voting);
        assert_eq!(cluster.nodes[0].offers, 1);
        assert_eq!(cluster.stats.log_offers, 1);

        let status = ReplicaContext::new(0, &mut cluster).apply_entry(4, &demote);
        assert_eq!(status, ApplyStatus::Applied);
        assert!(!cluster.nodes[2].voting);
    }

    #[test]
    fn test_send_tracks_batch_size() {
        let mut cluster = cluster(2);
        let message = virtraft_core::AppendEntries {
            term: 1,
            leader_id: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![committed(1, 1), committed(2, 1)],
        };

        assert!(ReplicaContext::new(0, &mut cluster).send(1, message.into()));
        assert_eq!(cluster.stats.max_batch_size, 2);
        assert_eq!(cluster.nodes[1].inbox.len(), 1);
    }
}
