//! Read-only snapshots of every replica.

use std::fmt;

use serde::Serialize;
use virtraft_core::{Engine, Index, NodeId, Role, Term};

use crate::{ConnectStatus, Node, Violation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaDiagnostics {
    pub slot: usize,
    pub id: NodeId,
    pub status: ConnectStatus,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub current_index: Index,
    pub last_log_term: Term,
    pub log_count: usize,
    pub voting: bool,
    pub partitioned: bool,
    pub inbox: usize,
}

/// Per-replica state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub tick: u64,
    pub replicas: Vec<ReplicaDiagnostics>,
}

const COLUMNS: [&str; 15] = [
    "slot", "id", "status", "role", "term", "voted", "leader", "commit", "applied", "current",
    "last_term", "logs", "voting", "part", "inbox",
];

impl Diagnostics {
    pub fn capture<E: Engine>(tick: u64, nodes: &[Node], engines: &[E]) -> Self {
        let replicas = nodes
            .iter()
            .zip(engines.iter())
            .map(|(node, engine)| {
                let current_index = engine.current_index();
                ReplicaDiagnostics {
                    slot: node.slot,
                    id: node.id,
                    status: node.status(),
                    role: engine.role(),
                    term: engine.current_term(),
                    voted_for: engine.voted_for(),
                    leader_id: engine.leader_id(),
                    commit_index: engine.commit_index(),
                    last_applied: engine.last_applied_index(),
                    current_index,
                    last_log_term: engine.entry_at(current_index).map_or(0, |e| e.term),
                    log_count: engine.log_count(),
                    voting: node.voting,
                    partitioned: node.partitioned,
                    inbox: node.inbox.len(),
                }
            })
            .collect();

        Self { tick, replicas }
    }

    fn rows(&self) -> Vec<[String; 15]> {
        let opt = |v: Option<NodeId>| v.map_or_else(|| "-".to_owned(), |v| v.to_string());
        self.replicas
            .iter()
            .map(|r| {
                [
                    r.slot.to_string(),
                    r.id.to_string(),
                    r.status.to_string(),
                    format!("{:?}", r.role).to_lowercase(),
                    r.term.to_string(),
                    opt(r.voted_for),
                    opt(r.leader_id),
                    r.commit_index.to_string(),
                    r.last_applied.to_string(),
                    r.current_index.to_string(),
                    r.last_log_term.to_string(),
                    r.log_count.to_string(),
                    r.voting.to_string(),
                    r.partitioned.to_string(),
                    r.inbox.to_string(),
                ]
            })
            .collect()
    }

    pub fn render_tsv(&self) -> String {
        let mut out = COLUMNS.join("\t");
        out.push('\n');
        for row in self.rows() {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.rows();
        let widths: Vec<usize> = COLUMNS
            .iter()
            .enumerate()
            .map(|(i, name)| {
                rows.iter()
                    .map(|row| row[i].len())
                    .max()
                    .unwrap_or(0)
                    .max(name.len())
            })
            .collect();

        writeln!(f, "tick {}", self.tick)?;
        for (name, &width) in COLUMNS.iter().zip(&widths) {
            write!(f, "{name:<width$} ")?;
        }
        writeln!(f)?;
        for row in rows {
            for (cell, &width) in row.iter().zip(&widths) {
                write!(f, "{cell:<width$} ")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A violation together with the cluster state at the moment it was detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub violation: Violation,
    pub diagnostics: Diagnostics,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "safety violation: {}", self.violation)?;
        write!(f, "{}", self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_nodes, StubEngine};

    #[test]
    fn test_capture_reads_every_replica() {
        let nodes = connected_nodes(2);
        let engines = vec![
            StubEngine::with_log(0, &[(1, 1), (2, 2)]).leading(2).committed(1),
            StubEngine::with_log(1, &[(1, 1)]),
        ];

        let diagnostics = Diagnostics::capture(12, &nodes, &engines);
        assert_eq!(diagnostics.tick, 12);
        assert_eq!(diagnostics.replicas.len(), 2);

        let leader = &diagnostics.replicas[0];
        assert_eq!(leader.role, Role::Leader);
        assert_eq!(leader.commit_index, 1);
        assert_eq!(leader.current_index, 2);
        assert_eq!(leader.last_log_term, 2);
        assert_eq!(leader.status, ConnectStatus::Connected);
    }

    #[test]
    fn test_renderings() {
        let nodes = connected_nodes(3);
        let engines: Vec<_> = (0..3).map(|id| StubEngine::with_log(id, &[])).collect();
        let diagnostics = Diagnostics::capture(0, &nodes, &engines);

        let tsv = diagnostics.render_tsv();
        assert_eq!(tsv.lines().count(), 4);
        assert!(tsv.starts_with("slot\tid\tstatus"));

        let table = diagnostics.to_string();
        assert!(table.starts_with("tick 0\n"));
        assert!(table.contains("connected"));
        assert!(table.contains("follower"));
    }
}
