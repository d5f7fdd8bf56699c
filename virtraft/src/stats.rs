//! Run statistics.

use std::fmt::Write;

use serde::Serialize;

/// Counters kept by the virtual network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub messages_partitioned: u64,
    pub messages_duplicated: u64,
    pub messages_undeliverable: u64,
    pub scripted_drops: u64,
}

/// Counters of one simulation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub ticks: u64,
    pub leadership_changes: u64,
    pub entries_proposed: u64,
    pub entries_rejected: u64,
    pub config_changes_proposed: u64,
    pub config_changes_rejected: u64,
    pub entries_applied: u64,
    pub max_commit_index: u64,
    pub max_batch_size: u64,
    pub log_offers: u64,
    pub log_polls: u64,
    pub log_pops: u64,
    pub fsm_errors: u64,
    pub replicas_quiesced: u64,
    pub replicas_recycled: u64,
    pub network: NetworkStats,
}

impl SimStats {
    fn fields(&self) -> Vec<(&'static str, u64)> {
        let n = &self.network;
        vec![
            ("ticks", self.ticks),
            ("leadership_changes", self.leadership_changes),
            ("entries_proposed", self.entries_proposed),
            ("entries_rejected", self.entries_rejected),
            ("config_changes_proposed", self.config_changes_proposed),
            ("config_changes_rejected", self.config_changes_rejected),
            ("entries_applied", self.entries_applied),
            ("max_commit_index", self.max_commit_index),
            ("max_batch_size", self.max_batch_size),
            ("log_offers", self.log_offers),
            ("log_polls", self.log_polls),
            ("log_pops", self.log_pops),
            ("fsm_errors", self.fsm_errors),
            ("replicas_quiesced", self.replicas_quiesced),
            ("replicas_recycled", self.replicas_recycled),
            ("messages_sent", n.messages_sent),
            ("messages_delivered", n.messages_delivered),
            ("messages_dropped", n.messages_dropped),
            ("messages_partitioned", n.messages_partitioned),
            ("messages_duplicated", n.messages_duplicated),
            ("messages_undeliverable", n.messages_undeliverable),
            ("scripted_drops", n.scripted_drops),
        ]
    }

    /// `key: value` lines.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.fields() {
            let _ = writeln!(out, "{key}: {value}");
        }
        out
    }

    /// Header line and value line, tab separated.
    pub fn render_tsv(&self) -> String {
        let fields = self.fields();
        let header: Vec<_> = fields.iter().map(|(k, _)| k.to_string()).collect();
        let values: Vec<_> = fields.iter().map(|(_, v)| v.to_string()).collect();
        format!("{}\n{}\n", header.join("\t"), values.join("\t"))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
