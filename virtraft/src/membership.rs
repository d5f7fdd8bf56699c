//! Membership lifecycle driven by cfg entries.
//!
//! A joining slot goes Disconnected, Connecting (AddNonVoting proposed), Connected
//! (AddVoting applied). A leaving slot goes Connected, Disconnecting (Demote proposed),
//! Disconnected (Remove applied, or its own Demote applied). Popping the entry that started
//! a transition undoes it.

use virtraft_core::{ApplyStatus, Entry, EntryKind, NodeId};

use crate::callbacks::Cluster;
use crate::ConnectStatus;

/// Work queued by a callback, run by the harness once the engine call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Propose the next cfg step at `origin`, if it is still the leader.
    Propose {
        origin: usize,
        kind: EntryKind,
        target: NodeId,
    },
    /// Take `slot` out of the cluster, if it still holds `id`.
    Quiesce { slot: usize, id: NodeId },
}

fn target_slot(cluster: &Cluster, entry: &Entry) -> Option<(NodeId, usize)> {
    let target = entry.target()?;
    cluster.slot_of(target).map(|slot| (target, slot))
}

/// A cfg entry was appended to some replica's log.
///
/// Voting rights only change once the entry is applied, an offer on a replica that later
/// loses its leadership must not pin them.
pub(crate) fn on_offer(cluster: &mut Cluster, entry: &Entry) {
    let Some((_, slot)) = target_slot(cluster, entry) else {
        return;
    };
    let node = &mut cluster.nodes[slot];

    if entry.kind == EntryKind::AddNonVoting && node.status() == ConnectStatus::Disconnected {
        node.advance();
    }
}

/// A cfg entry was truncated from some replica's log.
pub(crate) fn on_pop(cluster: &mut Cluster, entry: &Entry) {
    let Some((target, slot)) = target_slot(cluster, entry) else {
        return;
    };
    let node = &mut cluster.nodes[slot];
    if node.transition != Some(entry.id) {
        return;
    }

    match (entry.kind, node.status()) {
        (EntryKind::AddNonVoting, ConnectStatus::Connecting) => {
            tracing::debug!(replica = target, "join popped");
            cluster.defer(Deferred::Quiesce { slot, id: target });
        }
        (EntryKind::Demote, ConnectStatus::Disconnecting)
        | (EntryKind::Remove, ConnectStatus::Disconnecting) => {
            tracing::debug!(replica = target, kind = entry.kind.name(), "leave popped");
            node.transition = None;
            node.rollback();
        }
        _ => {}
    }
}

/// A committed cfg entry reached the state machine of the replica `id` in `slot`.
pub(crate) fn on_apply(
    cluster: &mut Cluster,
    slot: usize,
    id: NodeId,
    entry: &Entry,
) -> ApplyStatus {
    let Some(target) = entry.target() else {
        tracing::warn!(replica = id, entry = entry.id, "cfg entry without a target");
        return ApplyStatus::Applied;
    };

    match entry.kind {
        EntryKind::AddVoting => {
            if let Some(t) = cluster.slot_of(target) {
                let node = &mut cluster.nodes[t];
                if node.status() == ConnectStatus::Connecting {
                    node.advance();
                    node.voting = true;
                    node.transition = None;
                    tracing::info!(slot = t, replica = target, "replica joined as voter");
                }
            }
        }
        EntryKind::Demote => {
            if let Some(t) = cluster.slot_of(target) {
                cluster.nodes[t].voting = false;
            }
            if target == id {
                return ApplyStatus::Shutdown;
            }
            cluster.defer(Deferred::Propose {
                origin: slot,
                kind: EntryKind::Remove,
                target,
            });
        }
        EntryKind::Remove => {
            if target == id {
                return ApplyStatus::Shutdown;
            }
            if let Some(t) = cluster.slot_of(target) {
                if cluster.nodes[t].status() == ConnectStatus::Disconnecting {
                    cluster.defer(Deferred::Quiesce { slot: t, id: target });
                }
            }
        }
        EntryKind::AddNonVoting | EntryKind::Normal => {}
    }

    ApplyStatus::Applied
}

/// The leader in `slot` saw non-voting member `target` catch up.
pub(crate) fn on_sufficient_logs(cluster: &mut Cluster, slot: usize, target: NodeId) {
    let Some(t) = cluster.slot_of(target) else {
        return;
    };
    if cluster.nodes[t].status() == ConnectStatus::Connecting {
        cluster.defer(Deferred::Propose {
            origin: slot,
            kind: EntryKind::AddVoting,
            target,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultConfig, FsmKind, Node, VirtualNetwork};
    use virtraft_core::SimRng;

    /// Slots 0..size are Connected voters, except `joining` which is Connecting as id 100.
    fn cluster(size: usize, joining: Option<usize>) -> Cluster {
        let mut network = VirtualNetwork::new(FaultConfig::none());
        let nodes = (0..size)
            .map(|slot| {
                let id = if joining == Some(slot) { 100 } else { slot as NodeId };
                let mut node = Node::new(slot, id, FsmKind::Accumulator.build(4));
                node.advance();
                if joining != Some(slot) {
                    node.advance();
                    node.voting = true;
                }
                network.register(id, slot);
                node
            })
            .collect();
        Cluster::new(nodes, network, SimRng::new(3))
    }

    fn leave(cluster: &mut Cluster, slot: usize, entry: &Entry) {
        on_offer(cluster, entry);
        let node = &mut cluster.nodes[slot];
        node.advance();
        node.transition = Some(entry.id);
    }

    #[test]
    fn test_add_voting_connects() {
        let mut cluster = cluster(3, Some(2));
        let entry = Entry::config_change(1, EntryKind::AddVoting, 100);

        assert_eq!(on_apply(&mut cluster, 0, 0, &entry), ApplyStatus::Applied);
        assert_eq!(cluster.nodes[2].status(), ConnectStatus::Connected);
        assert!(cluster.nodes[2].voting);

        // later applies at other replicas change nothing
        on_apply(&mut cluster, 1, 1, &entry);
        assert_eq!(cluster.nodes[2].history().len(), 2);
    }

    #[test]
    fn test_popped_join_quiesces() {
        let mut cluster = cluster(3, Some(2));
        cluster.nodes[2].transition = Some(9);

        on_pop(&mut cluster, &Entry::config_change(8, EntryKind::AddNonVoting, 100));
        assert!(cluster.deferred.is_empty());

        on_pop(&mut cluster, &Entry::config_change(9, EntryKind::AddNonVoting, 100));
        assert_eq!(
            cluster.deferred.pop_front(),
            Some(Deferred::Quiesce { slot: 2, id: 100 })
        );
    }

    #[test]
    fn test_popped_demote_rolls_back() {
        let mut cluster = cluster(3, None);
        let demote = Entry::config_change(4, EntryKind::Demote, 1);
        leave(&mut cluster, 1, &demote);
        // offered only, the replica keeps voting
        assert!(cluster.nodes[1].voting);

        on_pop(&mut cluster, &demote);
        assert_eq!(cluster.nodes[1].status(), ConnectStatus::Connected);
        assert!(cluster.nodes[1].voting);

        // a second replica popping the same entry does nothing more
        on_pop(&mut cluster, &demote);
        assert_eq!(cluster.nodes[1].history().iter().filter(|c| c.rollback).count(), 1);
    }

    #[test]
    fn test_demote_then_remove() {
        let mut cluster = cluster(3, None);
        let demote = Entry::config_change(4, EntryKind::Demote, 2);
        leave(&mut cluster, 2, &demote);
        assert!(cluster.nodes[2].voting);

        assert_eq!(on_apply(&mut cluster, 0, 0, &demote), ApplyStatus::Applied);
        assert!(!cluster.nodes[2].voting);
        assert_eq!(
            cluster.deferred.pop_front(),
            Some(Deferred::Propose {
                origin: 0,
                kind: EntryKind::Remove,
                target: 2
            })
        );
        assert_eq!(on_apply(&mut cluster, 2, 2, &demote), ApplyStatus::Shutdown);

        let remove = Entry::config_change(5, EntryKind::Remove, 2);
        assert_eq!(on_apply(&mut cluster, 1, 1, &remove), ApplyStatus::Applied);
        assert_eq!(
            cluster.deferred.pop_front(),
            Some(Deferred::Quiesce { slot: 2, id: 2 })
        );
        assert_eq!(on_apply(&mut cluster, 2, 2, &remove), ApplyStatus::Shutdown);
    }

    #[test]
    fn test_sufficient_logs_deduplicated() {
        let mut cluster = cluster(3, Some(2));
        on_sufficient_logs(&mut cluster, 0, 100);
        on_sufficient_logs(&mut cluster, 0, 100);
        assert_eq!(cluster.deferred.len(), 1);

        // connected members are never promoted
        on_sufficient_logs(&mut cluster, 0, 1);
        assert_eq!(cluster.deferred.len(), 1);
    }
}
