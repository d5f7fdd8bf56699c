use std::collections::BTreeMap;

use virtraft_core::{Entry, EntryKind, Member, NodeId};

use crate::Log;

/// Cluster configuration as one engine sees it.
///
/// Cfg-change entries take effect as soon as they are appended. After a truncation the
/// configuration is rebuilt from the base members plus whatever the log still holds.
#[derive(Debug, Clone)]
pub struct Membership {
    base: BTreeMap<NodeId, bool>,
    current: BTreeMap<NodeId, bool>,
}

impl Membership {
    pub fn new(members: &[Member]) -> Self {
        let base: BTreeMap<_, _> = members.iter().map(|m| (m.id, m.voting)).collect();
        Self {
            current: base.clone(),
            base,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.current.contains_key(&id)
    }

    pub fn is_voting(&self, id: NodeId) -> bool {
        self.current.get(&id).copied().unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.current
            .iter()
            .filter(|(_, voting)| **voting)
            .map(|(id, _)| *id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.current.keys().copied()
    }

    pub fn members(&self) -> Vec<Member> {
        self.current
            .iter()
            .map(|(id, voting)| Member {
                id: *id,
                voting: *voting,
            })
            .collect()
    }

    /// Votes needed for a majority of the voters.
    pub fn quorum(&self) -> usize {
        self.voters().count() / 2 + 1
    }

    /// Whether `entry` makes sense against the current configuration.
    pub fn admits(&self, entry: &Entry) -> bool {
        let Some(target) = entry.target() else {
            return false;
        };
        match entry.kind {
            EntryKind::Normal => false,
            EntryKind::AddNonVoting => !self.contains(target),
            EntryKind::AddVoting => self.contains(target) && !self.is_voting(target),
            EntryKind::Demote => self.is_voting(target),
            EntryKind::Remove => self.contains(target),
        }
    }

    pub fn apply(&mut self, entry: &Entry) {
        apply_to(&mut self.current, entry);
    }

    pub fn rebuild(&mut self, log: &Log) {
        let mut current = self.base.clone();
        for (_, entry) in log.iter() {
            apply_to(&mut current, entry);
        }
        self.current = current;
    }
}

fn apply_to(config: &mut BTreeMap<NodeId, bool>, entry: &Entry) {
    let Some(target) = entry.target() else {
        return;
    };
    match entry.kind {
        EntryKind::Normal => {}
        EntryKind::AddNonVoting => {
            config.entry(target).or_insert(false);
        }
        EntryKind::AddVoting => {
            config.insert(target, true);
        }
        EntryKind::Demote => {
            if let Some(voting) = config.get_mut(&target) {
                *voting = false;
            }
        }
        EntryKind::Remove => {
            config.remove(&target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(kind: EntryKind, node: NodeId) -> Entry {
        Entry::config_change(0, kind, node)
    }

    #[test]
    fn test_quorum_counts_voters_only() {
        let mut membership = Membership::new(&[
            Member::voting(0),
            Member::voting(1),
            Member::voting(2),
            Member::non_voting(3),
        ]);
        assert_eq!(membership.quorum(), 2);

        membership.apply(&cfg(EntryKind::AddVoting, 3));
        assert_eq!(membership.quorum(), 3);
    }

    #[test]
    fn test_lifecycle_changes() {
        let mut membership = Membership::new(&[Member::voting(0), Member::voting(1)]);

        membership.apply(&cfg(EntryKind::AddNonVoting, 5));
        assert!(membership.contains(5));
        assert!(!membership.is_voting(5));

        membership.apply(&cfg(EntryKind::AddVoting, 5));
        assert!(membership.is_voting(5));

        membership.apply(&cfg(EntryKind::Demote, 5));
        assert!(!membership.is_voting(5));

        membership.apply(&cfg(EntryKind::Remove, 5));
        assert!(!membership.contains(5));
    }

    #[test]
    fn test_admits() {
        let membership = Membership::new(&[Member::voting(0), Member::non_voting(1)]);

        assert!(membership.admits(&cfg(EntryKind::AddNonVoting, 2)));
        assert!(!membership.admits(&cfg(EntryKind::AddNonVoting, 1)));
        assert!(membership.admits(&cfg(EntryKind::AddVoting, 1)));
        assert!(!membership.admits(&cfg(EntryKind::AddVoting, 0)));
        assert!(membership.admits(&cfg(EntryKind::Demote, 0)));
        assert!(!membership.admits(&cfg(EntryKind::Demote, 1)));
        assert!(membership.admits(&cfg(EntryKind::Remove, 1)));
        assert!(!membership.admits(&Entry::normal(0, vec![])));
    }

    #[test]
    fn test_rebuild_drops_truncated_changes() {
        let mut membership = Membership::new(&[Member::voting(0)]);
        let mut log = Log::new();
        let add = cfg(EntryKind::AddNonVoting, 9);
        membership.apply(&add);
        log.append(add);
        assert!(membership.contains(9));

        log.truncate_from(1);
        membership.rebuild(&log);
        assert!(!membership.contains(9));
        assert!(membership.is_voting(0));
    }
}
