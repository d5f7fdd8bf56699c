//! Virtual network for simulation.
//!
//! Each replica has one inbound FIFO. Faults are applied when a message is sent: it may be
//! dropped, discarded by a partitioned destination, or enqueued several times.

use std::collections::BTreeMap;

use virtraft_core::{Message, NodeId, SimRng};

use crate::{FaultConfig, NetworkStats, Node};

/// A message waiting in a replica's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

/// Routes messages by replica id into inboxes.
#[derive(Debug)]
pub struct VirtualNetwork {
    faults: FaultConfig,
    routes: BTreeMap<NodeId, usize>,
    stats: NetworkStats,
}

impl VirtualNetwork {
    pub fn new(faults: FaultConfig) -> Self {
        Self {
            faults,
            routes: BTreeMap::new(),
            stats: NetworkStats::default(),
        }
    }

    pub fn faults(&self) -> &FaultConfig {
        &self.faults
    }

    pub fn register(&mut self, id: NodeId, slot: usize) {
        self.routes.insert(id, slot);
    }

    pub fn unregister(&mut self, id: NodeId) {
        self.routes.remove(&id);
    }

    pub fn slot_of(&self, id: NodeId) -> Option<usize> {
        self.routes.get(&id).copied()
    }

    /// Deliver `message` to the inbox of `to`.
    ///
    /// Unknown and Disconnected destinations fail closed. Returns whether at least one copy
    /// was enqueued.
    pub fn send(
        &mut self,
        nodes: &mut [Node],
        rng: &SimRng,
        from: NodeId,
        to: NodeId,
        message: Message,
    ) -> bool {
        self.stats.messages_sent += 1;

        let Some(node) = self
            .slot_of(to)
            .and_then(|slot| nodes.get_mut(slot))
            .filter(|node| node.is_active())
        else {
            self.stats.messages_undeliverable += 1;
            return false;
        };

        if rng.chance(self.faults.drop_rate) {
            self.stats.messages_dropped += 1;
            return false;
        }

        if node.partitioned {
            self.stats.messages_partitioned += 1;
            return false;
        }

        node.inbox.push_back(Envelope {
            from,
            message: message.clone(),
        });
        self.stats.messages_delivered += 1;

        while rng.chance(self.faults.dupe_rate) {
            node.inbox.push_back(Envelope {
                from,
                message: message.clone(),
            });
            self.stats.messages_duplicated += 1;
        }

        true
    }

    /// Discard the head of `node`'s inbox.
    pub fn drop_one(&mut self, node: &mut Node) -> Option<Envelope> {
        let envelope = node.inbox.pop_front();
        if envelope.is_some() {
            self.stats.scripted_drops += 1;
        }
        envelope
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }
}
