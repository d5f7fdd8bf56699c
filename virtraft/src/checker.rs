//! Cross-replica safety checks.
//!
//! Run after every fuzz tick and after every scripted command that can change protocol
//! state. Only active replicas take part.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use virtraft_core::{Engine, EntryKind, Index, NodeId};

use crate::Node;

/// Result of a correctness check.
#[derive(Debug)]
pub struct CheckResult {
    /// Whether the check passed.
    pub passed: bool,
    /// List of violations found.
    pub violations: Vec<Violation>,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    pub fn fail(violations: Vec<Violation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }

    fn from_violations(violations: Vec<Violation>) -> Self {
        if violations.is_empty() {
            Self::pass()
        } else {
            Self::fail(violations)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.passed
    }

    pub fn merge(mut self, other: CheckResult) -> Self {
        self.passed &= other.passed;
        self.violations.extend(other.violations);
        self
    }

    /// Consume the result, keeping the first violation.
    pub fn into_first(self) -> Option<Violation> {
        self.violations.into_iter().next()
    }
}

/// A specific violation of a safety property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Human-readable description of the violation.
    pub description: String,
    /// Replica ids involved.
    pub replicas: Vec<NodeId>,
    pub violation_type: ViolationType,
}

impl Violation {
    pub fn new(violation_type: ViolationType, replicas: Vec<NodeId>, description: String) -> Self {
        Self {
            description,
            replicas,
            violation_type,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.violation_type, self.description)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationType {
    /// Two leaders in one term.
    ElectionSafety,
    /// A committed entry is not held by a voting majority.
    LeaderCompleteness,
    /// Logs agree on `(index, term)` but differ earlier.
    LogMatching,
    /// Two replicas committed different entries at one index.
    StateMachineSafety,
    /// A committed entry was removed from a log.
    CommittedEntryPopped,
    /// A replica persisted a smaller term than before.
    TermRegression,
    /// A slot was recycled while messages for its old identity were queued.
    Lifecycle,
}

/// Checks run over the whole cluster.
pub struct InvariantChecker;

impl InvariantChecker {
    /// Run every check, `log_matching` gates the pairwise log comparison.
    pub fn check_all<E: Engine>(nodes: &[Node], engines: &[E], log_matching: bool) -> CheckResult {
        let result = Self::check_election_safety(nodes, engines)
            .merge(Self::check_leader_completeness(nodes, engines));
        if log_matching {
            result.merge(Self::check_log_matching(nodes, engines))
        } else {
            result
        }
    }

    /// At most one leader per term.
    pub fn check_election_safety<E: Engine>(nodes: &[Node], engines: &[E]) -> CheckResult {
        let leaders: Vec<_> = active(nodes, engines)
            .filter(|(_, engine)| engine.is_leader())
            .map(|(node, engine)| (node.id, engine.current_term()))
            .collect();

        let mut violations = Vec::new();
        for (i, (a, term_a)) in leaders.iter().enumerate() {
            for (b, term_b) in leaders.iter().skip(i + 1) {
                if term_a == term_b {
                    violations.push(Violation::new(
                        ViolationType::ElectionSafety,
                        vec![*a, *b],
                        format!("replicas {a} and {b} both lead term {term_a}"),
                    ));
                }
            }
        }

        CheckResult::from_violations(violations)
    }

    /// The entry at every replica's commit index is held, or at least not contradicted, by
    /// a majority of the voting replicas.
    ///
    /// Voters come from the configuration of the replica being checked, as of any index
    /// between its commit index and its last entry; the commit stands if one of those
    /// configurations has an agreeing majority. Members that are not active take no part.
    pub fn check_leader_completeness<E: Engine>(nodes: &[Node], engines: &[E]) -> CheckResult {
        let replicas: BTreeMap<NodeId, &E> = active(nodes, engines)
            .map(|(node, engine)| (node.id, engine))
            .collect();

        let mut violations = Vec::new();
        for (node, engine) in active(nodes, engines) {
            let commit = engine.commit_index();
            if commit == 0 {
                continue;
            }

            let Some(committed) = engine.entry_at(commit) else {
                violations.push(Violation::new(
                    ViolationType::LeaderCompleteness,
                    vec![node.id],
                    format!("replica {} commit index {commit} is beyond its log", node.id),
                ));
                continue;
            };

            let tallies: Vec<(usize, usize)> = configurations(engine, commit)
                .iter()
                .map(|voters| {
                    let present: Vec<&E> =
                        voters.iter().filter_map(|id| replicas.get(id).copied()).collect();
                    let holders = present
                        .iter()
                        .filter(|voter| {
                            voter
                                .entry_at(commit)
                                .map_or(true, |entry| entry.same_as(committed))
                        })
                        .count();
                    (holders, present.len())
                })
                .collect();

            if tallies.iter().any(|(holders, voters)| *voters == 0 || holders * 2 > *voters) {
                continue;
            }

            let (holders, voters) = tallies.first().copied().unwrap_or_default();
            violations.push(Violation::new(
                ViolationType::LeaderCompleteness,
                vec![node.id],
                format!(
                    "replica {} committed {commit} (term {}, id {}) but only {holders} of \
                     {voters} voters agree",
                    node.id, committed.term, committed.id,
                ),
            ));
        }

        CheckResult::from_violations(violations)
    }

    /// Any two logs holding an entry of the same term at one index hold identical entries up
    /// to that index.
    ///
    /// Prefixes both replicas already applied went through the commit ledger, so only the
    /// part above the lower applied index is compared.
    pub fn check_log_matching<E: Engine>(nodes: &[Node], engines: &[E]) -> CheckResult {
        let replicas: Vec<_> = active(nodes, engines).collect();

        let mut violations = Vec::new();
        for (i, (node_a, a)) in replicas.iter().enumerate() {
            for (node_b, b) in replicas.iter().skip(i + 1) {
                let floor = a.last_applied_index().min(b.last_applied_index());
                let top = a.current_index().min(b.current_index());

                let Some(anchor) = (floor + 1..=top).rev().find(|&index| same_term(*a, *b, index))
                else {
                    continue;
                };

                let diverged = (floor + 1..=anchor).find(|&index| {
                    match (a.entry_at(index), b.entry_at(index)) {
                        (Some(x), Some(y)) => !x.same_as(y) || x.kind != y.kind,
                        _ => true,
                    }
                });

                if let Some(index) = diverged {
                    violations.push(Violation::new(
                        ViolationType::LogMatching,
                        vec![node_a.id, node_b.id],
                        format!(
                            "replicas {} and {} agree on term at {anchor} but differ at {index}",
                            node_a.id, node_b.id
                        ),
                    ));
                }
            }
        }

        CheckResult::from_violations(violations)
    }
}

fn active<'a, E: Engine>(
    nodes: &'a [Node],
    engines: &'a [E],
) -> impl Iterator<Item = (&'a Node, &'a E)> {
    nodes
        .iter()
        .zip(engines.iter())
        .filter(|(node, _)| node.is_active())
}

/// Voting sets of `engine`'s configuration as of each index from its last entry back to
/// `from`, newest first, consecutive duplicates removed.
fn configurations<E: Engine>(engine: &E, from: Index) -> Vec<BTreeSet<NodeId>> {
    let mut voters: BTreeSet<NodeId> = engine
        .members()
        .into_iter()
        .filter(|member| member.voting)
        .map(|member| member.id)
        .collect();

    let mut configs = vec![voters.clone()];
    for index in (from + 1..=engine.current_index()).rev() {
        let Some(entry) = engine.entry_at(index) else {
            continue;
        };
        let Some(target) = entry.target() else {
            continue;
        };
        let changed = match entry.kind {
            EntryKind::AddVoting => voters.remove(&target),
            EntryKind::Demote => voters.insert(target),
            _ => false,
        };
        if changed {
            configs.push(voters.clone());
        }
    }
    configs
}

fn same_term<E: Engine>(a: &E, b: &E, index: Index) -> bool {
    match (a.entry_at(index), b.entry_at(index)) {
        (Some(x), Some(y)) => x.term == y.term,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_nodes, StubEngine};
    use virtraft_core::Entry;

    #[test]
    fn test_leaders_in_distinct_terms_pass() {
        let nodes = connected_nodes(3);
        let engines = vec![
            StubEngine::with_log(0, &[]).leading(1),
            StubEngine::with_log(1, &[]).leading(2),
            StubEngine::with_log(2, &[]),
        ];
        assert!(InvariantChecker::check_election_safety(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_two_leaders_same_term_fail() {
        let nodes = connected_nodes(3);
        let engines = vec![
            StubEngine::with_log(0, &[]).leading(3),
            StubEngine::with_log(1, &[]),
            StubEngine::with_log(2, &[]).leading(3),
        ];

        let result = InvariantChecker::check_election_safety(&nodes, &engines);
        assert!(!result.is_ok());
        let violation = result.into_first().unwrap();
        assert_eq!(violation.violation_type, ViolationType::ElectionSafety);
        assert_eq!(violation.replicas, vec![0, 2]);
    }

    #[test]
    fn test_disconnected_leader_ignored() {
        let mut nodes = connected_nodes(2);
        nodes[1].retire();
        let engines = vec![
            StubEngine::with_log(0, &[]).leading(3),
            StubEngine::with_log(1, &[]).leading(3),
        ];
        assert!(InvariantChecker::check_election_safety(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_absent_entries_count_toward_completeness() {
        let nodes = connected_nodes(3);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (1, 2)]).committed(2).voters(&[0, 1, 2]),
            StubEngine::with_log(1, &[(1, 1)]),
            StubEngine::with_log(2, &[]),
        ];
        assert!(InvariantChecker::check_leader_completeness(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_contradicted_commit_fails_completeness() {
        let nodes = connected_nodes(3);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (1, 2)]).committed(2).voters(&[0, 1, 2]),
            StubEngine::with_log(1, &[(1, 1), (2, 7)]),
            StubEngine::with_log(2, &[(1, 1), (2, 7)]),
        ];

        let result = InvariantChecker::check_leader_completeness(&nodes, &engines);
        let violation = result.into_first().unwrap();
        assert_eq!(violation.violation_type, ViolationType::LeaderCompleteness);
        assert_eq!(violation.replicas, vec![0]);
        assert!(violation.description.contains("only 1 of 3 voters"));
    }

    #[test]
    fn test_non_voters_excluded_from_completeness() {
        let nodes = connected_nodes(3);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1)]).committed(1).voters(&[0]),
            StubEngine::with_log(1, &[(2, 9)]),
            StubEngine::with_log(2, &[(2, 9)]),
        ];
        assert!(InvariantChecker::check_leader_completeness(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_completeness_uses_configuration_of_committer() {
        // harness flags say slot 2 is leaving, its own configuration still counts it
        let mut nodes = connected_nodes(4);
        nodes[2].voting = false;
        nodes[2].advance();
        let stale = {
            let mut engine = StubEngine::with_log(0, &[(1, 1), (3, 5)]);
            let mut demote = Entry::config_change(6, EntryKind::Demote, 2);
            demote.term = 3;
            engine.log.push(demote);
            engine.voters(&[0, 3])
        };
        let engines = vec![
            stale,
            StubEngine::with_log(1, &[]),
            StubEngine::with_log(2, &[(1, 1), (4, 8)])
                .leading(4)
                .committed(2)
                .voters(&[0, 2, 3]),
            StubEngine::with_log(3, &[(1, 1), (4, 8)]).committed(2).voters(&[0, 2, 3]),
        ];
        assert!(InvariantChecker::check_leader_completeness(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_completeness_accepts_configuration_at_commit() {
        // slot 1 held the entry and was demoted right after it committed
        let nodes = connected_nodes(3);
        let mut leader = StubEngine::with_log(0, &[(1, 1), (2, 2)]);
        let mut demote = Entry::config_change(3, EntryKind::Demote, 1);
        demote.term = 2;
        leader.log.push(demote);
        let engines = vec![
            leader.leading(2).committed(2).voters(&[0, 2]),
            StubEngine::with_log(1, &[(1, 1), (2, 2)]),
            StubEngine::with_log(2, &[(1, 1), (1, 9)]),
        ];
        assert!(InvariantChecker::check_leader_completeness(&nodes, &engines).is_ok());

        // without the demote in its log, the same voters contradict the commit
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (2, 2)])
                .leading(2)
                .committed(2)
                .voters(&[0, 2]),
            StubEngine::with_log(1, &[(1, 1), (2, 2)]),
            StubEngine::with_log(2, &[(1, 1), (1, 9)]),
        ];
        assert!(!InvariantChecker::check_leader_completeness(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_inactive_members_take_no_part() {
        let mut nodes = connected_nodes(3);
        nodes[1].retire();
        nodes[2].retire();
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1)]).committed(1).voters(&[0, 1, 2]),
            StubEngine::with_log(1, &[(2, 9)]),
            StubEngine::with_log(2, &[(2, 9)]),
        ];
        assert!(InvariantChecker::check_leader_completeness(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_log_matching_detects_divergent_prefix() {
        let nodes = connected_nodes(2);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (1, 2), (2, 3)]),
            StubEngine::with_log(1, &[(1, 1), (1, 5), (2, 3)]),
        ];

        let result = InvariantChecker::check_log_matching(&nodes, &engines);
        let violation = result.into_first().unwrap();
        assert_eq!(violation.violation_type, ViolationType::LogMatching);
        assert!(violation.description.contains("differ at 2"));
    }

    #[test]
    fn test_log_matching_allows_divergent_tail() {
        let nodes = connected_nodes(2);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (2, 2), (2, 3)]),
            StubEngine::with_log(1, &[(1, 1), (3, 4)]),
        ];
        assert!(InvariantChecker::check_log_matching(&nodes, &engines).is_ok());
    }

    #[test]
    fn test_check_all_merges() {
        let nodes = connected_nodes(2);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (1, 2), (2, 3)]).leading(2),
            StubEngine::with_log(1, &[(1, 1), (1, 5), (2, 3)]).leading(2),
        ];

        let result = InvariantChecker::check_all(&nodes, &engines, true);
        let kinds: Vec<_> = result.violations.iter().map(|v| v.violation_type).collect();
        assert_eq!(
            kinds,
            vec![ViolationType::ElectionSafety, ViolationType::LogMatching]
        );

        let result = InvariantChecker::check_all(&nodes, &engines, false);
        assert_eq!(result.violations.len(), 1);
    }
}
