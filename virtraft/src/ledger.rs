//! Cluster-wide record of committed entries.
//!
//! The first replica to apply index `i` fills slot `i`; every later apply at `i` must carry
//! the same `{term, id}`. One array lookup per commit.

use virtraft_core::{EntryId, Index, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub term: Term,
    pub id: EntryId,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    occupied: bool,
    term: Term,
    id: EntryId,
}

/// Outcome of recording a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerCheck {
    /// First commit seen at this index
    Recorded,
    /// Matches the earlier commit
    Matched,
    /// Conflicts with the earlier commit
    Diverged { recorded: LedgerEntry },
}

#[derive(Debug, Default)]
pub struct CommitLedger {
    slots: Vec<Slot>,
}

impl CommitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, index: Index, term: Term, id: EntryId) -> LedgerCheck {
        let at = index as usize;
        if at >= self.slots.len() {
            self.slots.resize(at + 1, Slot::default());
        }

        let slot = &mut self.slots[at];
        if !slot.occupied {
            *slot = Slot {
                occupied: true,
                term,
                id,
            };
            return LedgerCheck::Recorded;
        }

        if slot.term == term && slot.id == id {
            LedgerCheck::Matched
        } else {
            LedgerCheck::Diverged {
                recorded: LedgerEntry {
                    term: slot.term,
                    id: slot.id,
                },
            }
        }
    }

    pub fn get(&self, index: Index) -> Option<LedgerEntry> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.occupied)
            .map(|slot| LedgerEntry {
                term: slot.term,
                id: slot.id,
            })
    }

    /// Whether `{term, id}` is what was committed at `index`.
    pub fn is_committed(&self, index: Index, term: Term, id: EntryId) -> bool {
        self.get(index)
            .is_some_and(|entry| entry.term == term && entry.id == id)
    }

    /// Highest index recorded so far.
    pub fn highest(&self) -> Index {
        self.slots
            .iter()
            .rposition(|slot| slot.occupied)
            .map(|at| at as Index)
            .unwrap_or(0)
    }
}
