//! Simulation harness.
//!
//! Provides the main `Simulation` type that owns the engines, the virtual network, the
//! commit ledger and the generator, and drives them in fuzz or scripted mode.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use virtraft_core::{
    Callbacks, EngineError, EngineInit, Entry, EntryId, EntryKind, Member, Message, NodeId,
    ProposalReceipt, ProposalRejection, SimRng,
};
use virtraft_raft::RaftEngine;

use crate::callbacks::{Cluster, ReplicaContext};
use crate::membership::Deferred;
use crate::{
    Command, CommandReader, ConnectStatus, Diagnostics, Envelope, Failure, FaultConfig,
    InvariantChecker, Node, Result, SimConfig, SimError, SimStats, Violation, ViolationType,
    VirtualNetwork,
};

/// Dump request shared with an interrupt handler.
///
/// The handler only sets the flag; the tick loop notices it and logs the diagnostics table.
#[derive(Clone, Debug, Default)]
pub struct DumpRequest(Arc<AtomicBool>);

impl DumpRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// What a membership toggle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// No leader to propose through
    NoLeader,
    /// The slot is the leader, nothing changes
    IsLeader,
    /// The slot is already joining or leaving
    InTransition,
    /// The slot was recycled under a fresh id and is joining
    Joining(NodeId),
    /// The replica is leaving
    Leaving(NodeId),
    /// The leader refused the cfg entry
    Rejected(Option<ProposalRejection>),
}

/// Main simulation harness.
pub struct Simulation<E = RaftEngine> {
    config: SimConfig,

    cluster: Cluster,

    /// One engine per slot, same order as the cluster's nodes.
    engines: Vec<E>,

    /// Every id ever handed to a replica. Never pruned: a retired id may still sit in a
    /// stale log or message, so it must not come back.
    used_ids: BTreeSet<NodeId>,

    next_entry_id: EntryId,

    last_leader: Option<NodeId>,

    halted: bool,

    dump: DumpRequest,
}

impl Simulation<RaftEngine> {
    /// Create a new simulation builder.
    pub fn builder() -> SimulationBuilder {
        SimulationBuilder::default()
    }
}

impl<E: virtraft_core::Engine> Simulation<E> {
    /// Validate `config` and bootstrap every slot as a connected voter with id equal to
    /// its slot.
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;

        let rng = SimRng::new(config.seed);
        let mut network = VirtualNetwork::new(config.faults.clone());
        let members: Vec<Member> = (0..config.nodes)
            .map(|slot| Member::voting(slot as NodeId))
            .collect();

        let mut nodes = Vec::with_capacity(config.nodes);
        let mut engines = Vec::with_capacity(config.nodes);
        let mut used_ids = BTreeSet::new();
        for slot in 0..config.nodes {
            let id = slot as NodeId;
            let mut node = Node::new(slot, id, config.fsm.build(config.fsm_cells));
            node.advance();
            node.advance();
            node.voting = true;
            network.register(id, slot);
            used_ids.insert(id);
            nodes.push(node);
            engines.push(E::new(engine_init(&config, &rng, id, members.clone())));
        }

        tracing::info!(nodes = config.nodes, seed = config.seed, "starting simulation");

        Ok(Self {
            cluster: Cluster::new(nodes, network, rng),
            engines,
            used_ids,
            next_entry_id: 0,
            last_leader: None,
            halted: false,
            dump: DumpRequest::default(),
            config,
        })
    }

    /// Get the simulation seed.
    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[Node] {
        &self.cluster.nodes
    }

    pub fn node(&self, slot: usize) -> Option<&Node> {
        self.cluster.nodes.get(slot)
    }

    pub fn engines(&self) -> &[E] {
        &self.engines
    }

    pub fn engine(&self, slot: usize) -> Option<&E> {
        self.engines.get(slot)
    }

    pub fn ledger(&self) -> &crate::CommitLedger {
        &self.cluster.ledger
    }

    /// Run statistics, network counters included.
    pub fn stats(&self) -> SimStats {
        let mut stats = self.cluster.stats.clone();
        stats.network = self.cluster.network.stats().clone();
        stats
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::capture(self.cluster.stats.ticks, &self.cluster.nodes, &self.engines)
    }

    /// Handle for requesting a diagnostics dump from another thread.
    pub fn dump_handle(&self) -> DumpRequest {
        self.dump.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Slot of the nominal leader: the active leader with the highest term.
    pub fn leader(&self) -> Option<usize> {
        self.cluster
            .nodes
            .iter()
            .zip(&self.engines)
            .filter(|(node, engine)| node.is_active() && engine.is_leader())
            .max_by_key(|(node, engine)| (engine.current_term(), std::cmp::Reverse(node.slot)))
            .map(|(node, _)| node.slot)
    }

    /// Execute one fuzz tick.
    pub fn tick(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.service_dump_request();

        if self.cluster.rng.chance(self.config.client_rate) {
            self.propose_client_entry()?;
        }

        let slots = self.cluster.nodes.len();
        for slot in 0..slots {
            self.poll(slot)?;
        }

        for slot in 0..slots {
            if self.cluster.rng.chance(self.config.membership_rate) {
                self.toggle_membership(slot)?;
            }
        }

        for slot in 0..slots {
            if self.cluster.rng.chance(self.config.faults.partition_rate) {
                self.toggle_partition(slot)?;
            }
        }

        for slot in 0..slots {
            let elapsed = self.config.tick_ms(&self.cluster.rng);
            self.periodic(slot, elapsed)?;
        }

        self.settle_transitions();
        self.check_safety()?;
        self.observe_leader();
        self.cluster.stats.ticks += 1;
        Ok(())
    }

    /// Execute `ticks` fuzz ticks.
    pub fn run(&mut self, ticks: u64) -> Result<()> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    /// Run for the configured iteration count, or forever when there is none.
    pub fn run_configured(&mut self) -> Result<()> {
        match self.config.iterations {
            Some(ticks) => self.run(ticks),
            None => loop {
                self.tick()?;
            },
        }
    }

    /// Tick until `condition` holds, at most `max_ticks` times.
    pub fn run_until<F>(&mut self, max_ticks: u64, condition: F) -> Result<bool>
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..max_ticks {
            if condition(self) {
                return Ok(true);
            }
            self.tick()?;
        }
        Ok(condition(self))
    }

    /// Replay a command stream. Returns the number of commands executed.
    pub fn run_script<R: Read>(&mut self, reader: R) -> Result<usize> {
        let mut executed = 0;
        for command in CommandReader::new(reader) {
            self.execute(command?)?;
            executed += 1;
        }
        tracing::debug!(executed, "script finished");
        Ok(executed)
    }

    pub fn execute(&mut self, command: Command) -> Result<()> {
        self.ensure_running()?;
        if let Some(slot) = command.slot() {
            self.check_slot(slot)?;
        }

        match command {
            Command::Tick => return self.tick(),
            Command::Periodic(slot) => {
                self.periodic(slot, self.config.period.fixed_ms)?;
                self.check_safety()?;
            }
            Command::Receive(slot) => {
                self.propose_client_entry()?;
                self.poll(slot)?;
                self.check_safety()?;
            }
            Command::Drop(slot) => {
                self.propose_client_entry()?;
                self.drop_one(slot)?;
                self.check_safety()?;
            }
            Command::Partition(slot) => {
                self.toggle_partition(slot)?;
            }
            Command::ToggleMembership(slot) => {
                self.toggle_membership(slot)?;
                self.check_safety()?;
            }
        }

        self.settle_transitions();
        self.observe_leader();
        Ok(())
    }

    /// Advance the clock of `slot` by `elapsed_ms`.
    pub fn periodic(&mut self, slot: usize, elapsed_ms: u64) -> Result<()> {
        self.ensure_running()?;
        self.check_slot(slot)?;
        if !self.cluster.nodes[slot].is_active() {
            return Ok(());
        }

        let outcome = self.invoke(slot, |engine, cb| engine.tick(elapsed_ms, cb))?;
        self.log_engine_error(slot, outcome);
        Ok(())
    }

    /// Drain the inbox of `slot` in FIFO order.
    pub fn poll(&mut self, slot: usize) -> Result<()> {
        self.ensure_running()?;
        self.check_slot(slot)?;

        while self.cluster.nodes[slot].is_active() {
            let Some(envelope) = self.cluster.nodes[slot].inbox.pop_front() else {
                break;
            };
            self.deliver(slot, envelope)?;
        }
        Ok(())
    }

    /// Discard the head of the inbox of `slot`.
    pub fn drop_one(&mut self, slot: usize) -> Result<Option<Envelope>> {
        self.ensure_running()?;
        self.check_slot(slot)?;

        let Cluster { nodes, network, .. } = &mut self.cluster;
        Ok(network.drop_one(&mut nodes[slot]))
    }

    /// Flip the inbound partition flag of `slot`. Returns the new flag.
    pub fn toggle_partition(&mut self, slot: usize) -> Result<bool> {
        self.ensure_running()?;
        self.check_slot(slot)?;

        let node = &mut self.cluster.nodes[slot];
        node.partitioned = !node.partitioned;
        tracing::debug!(slot, partitioned = node.partitioned, "partition toggled");
        Ok(node.partitioned)
    }

    /// Start moving `slot` into or out of the cluster through the leader.
    pub fn toggle_membership(&mut self, slot: usize) -> Result<ToggleOutcome> {
        self.ensure_running()?;
        self.check_slot(slot)?;

        let Some(leader) = self.leader() else {
            return Ok(ToggleOutcome::NoLeader);
        };
        if leader == slot {
            return Ok(ToggleOutcome::IsLeader);
        }

        match self.cluster.nodes[slot].status() {
            ConnectStatus::Connecting | ConnectStatus::Disconnecting => {
                Ok(ToggleOutcome::InTransition)
            }
            ConnectStatus::Disconnected => self.join(slot, leader),
            ConnectStatus::Connected => self.leave(slot, leader),
        }
    }

    /// Propose a client entry at the nominal leader. Returns whether it was accepted.
    pub fn propose_client_entry(&mut self) -> Result<bool> {
        self.ensure_running()?;
        let Some(leader) = self.leader() else {
            return Ok(false);
        };

        let data = self.cluster.nodes[leader]
            .fsm
            .random_command(&self.cluster.rng);
        let entry = Entry::normal(self.next_entry_id(), data);

        match self.invoke(leader, |engine, cb| engine.propose(entry, cb))? {
            Ok(_) => {
                self.cluster.stats.entries_proposed += 1;
                Ok(true)
            }
            Err(err) => {
                self.cluster.stats.entries_rejected += 1;
                tracing::debug!(slot = leader, %err, "client entry rejected");
                Ok(false)
            }
        }
    }

    /// Run every safety check, halting on the first violation.
    pub fn check_safety(&mut self) -> Result<()> {
        self.ensure_running()?;
        let result = InvariantChecker::check_all(
            &self.cluster.nodes,
            &self.engines,
            self.config.check_log_matching,
        );
        match result.into_first() {
            Some(violation) => Err(self.halt(violation)),
            None => Ok(()),
        }
    }

    fn join(&mut self, slot: usize, leader: usize) -> Result<ToggleOutcome> {
        if !self.cluster.nodes[slot].inbox.is_empty() {
            let node = &self.cluster.nodes[slot];
            let violation = Violation::new(
                ViolationType::Lifecycle,
                vec![node.id],
                format!(
                    "slot {slot} recycled with {} queued messages for replica {}",
                    node.inbox.len(),
                    node.id
                ),
            );
            return Err(self.halt(violation));
        }

        let id = self.fresh_id();
        let entry = Entry::config_change(self.next_entry_id(), EntryKind::AddNonVoting, id);
        let receipt = match self.propose_config(leader, entry)? {
            Ok(receipt) => receipt,
            Err(reason) => return Ok(ToggleOutcome::Rejected(reason)),
        };

        let mut members = self.engines[leader].members();
        if !members.iter().any(|m| m.id == id) {
            members.push(Member::non_voting(id));
        }
        let init = engine_init(&self.config, &self.cluster.rng, id, members);

        let node = &mut self.cluster.nodes[slot];
        node.id = id;
        node.voting = false;
        node.offers = 0;
        node.fsm = self.config.fsm.build(self.config.fsm_cells);
        node.reset_persisted();
        node.transition = Some(receipt.id);
        node.advance();

        self.used_ids.insert(id);
        self.cluster.network.register(id, slot);
        self.engines[slot] = E::new(init);
        self.cluster.stats.replicas_recycled += 1;

        tracing::info!(slot, replica = id, "replica joining");
        Ok(ToggleOutcome::Joining(id))
    }

    fn leave(&mut self, slot: usize, leader: usize) -> Result<ToggleOutcome> {
        let id = self.cluster.nodes[slot].id;
        let entry = Entry::config_change(self.next_entry_id(), EntryKind::Demote, id);
        let receipt = match self.propose_config(leader, entry)? {
            Ok(receipt) => receipt,
            Err(reason) => return Ok(ToggleOutcome::Rejected(reason)),
        };

        let node = &mut self.cluster.nodes[slot];
        if node.status() == ConnectStatus::Connected {
            node.advance();
            node.transition = Some(receipt.id);
        }

        tracing::info!(slot, replica = id, "replica leaving");
        Ok(ToggleOutcome::Leaving(id))
    }

    /// Propose a cfg entry at `leader`, counting the outcome.
    fn propose_config(
        &mut self,
        leader: usize,
        entry: Entry,
    ) -> Result<std::result::Result<ProposalReceipt, Option<ProposalRejection>>> {
        let kind = entry.kind;
        match self.invoke(leader, |engine, cb| engine.propose(entry, cb))? {
            Ok(receipt) => {
                self.cluster.stats.config_changes_proposed += 1;
                tracing::debug!(
                    slot = leader,
                    kind = kind.name(),
                    index = receipt.index,
                    "cfg change proposed"
                );
                Ok(Ok(receipt))
            }
            Err(err) => {
                self.cluster.stats.config_changes_rejected += 1;
                tracing::debug!(slot = leader, kind = kind.name(), %err, "cfg change rejected");
                Ok(Err(err.rejection()))
            }
        }
    }

    fn deliver(&mut self, slot: usize, envelope: Envelope) -> Result<()> {
        let Envelope { from, message } = envelope;
        let outcome = self.invoke(slot, move |engine, cb| {
            match message {
                Message::RequestVote(req) => {
                    let resp = engine.recv_request_vote(from, req, cb)?;
                    cb.send(from, resp.into());
                }
                Message::RequestVoteResponse(resp) => {
                    engine.recv_request_vote_response(from, resp, cb)?
                }
                Message::AppendEntries(req) => {
                    let resp = engine.recv_append_entries(from, req, cb)?;
                    cb.send(from, resp.into());
                }
                Message::AppendEntriesResponse(resp) => {
                    engine.recv_append_entries_response(from, resp, cb)?
                }
            }
            Ok(())
        })?;
        self.log_engine_error(slot, outcome);
        Ok(())
    }

    /// Call into the engine of `slot`, then settle whatever the callbacks left behind:
    /// a shutdown quiesces the slot, a violation halts the run, deferred actions run.
    fn invoke<T, F>(
        &mut self,
        slot: usize,
        call: F,
    ) -> Result<virtraft_core::Result<T>>
    where
        F: FnOnce(&mut E, &mut dyn Callbacks) -> virtraft_core::Result<T>,
    {
        let outcome = {
            let mut ctx = ReplicaContext::new(slot, &mut self.cluster);
            call(&mut self.engines[slot], &mut ctx)
        };

        if matches!(outcome, Err(EngineError::Shutdown)) {
            self.quiesce(slot);
        }
        if let Some(violation) = self.cluster.fatal.take() {
            return Err(self.halt(violation));
        }
        self.drain_deferred()?;
        Ok(outcome)
    }

    fn drain_deferred(&mut self) -> Result<()> {
        while let Some(action) = self.cluster.deferred.pop_front() {
            match action {
                Deferred::Propose {
                    origin,
                    kind,
                    target,
                } => {
                    let origin_leads = self.cluster.nodes[origin].is_active()
                        && self.engines[origin].is_leader();
                    if !origin_leads {
                        continue;
                    }
                    let entry = Entry::config_change(self.next_entry_id(), kind, target);
                    if let Ok(receipt) = self.propose_config(origin, entry)? {
                        if kind == EntryKind::Remove {
                            if let Some(t) = self.cluster.slot_of(target) {
                                self.cluster.nodes[t].transition = Some(receipt.id);
                            }
                        }
                    }
                }
                Deferred::Quiesce { slot, id } => {
                    let node = &self.cluster.nodes[slot];
                    if node.id == id && node.is_active() {
                        self.quiesce(slot);
                    }
                }
            }
        }
        Ok(())
    }

    /// Undo transitions whose cfg entry can never commit.
    ///
    /// A leader of the newest term known anywhere, engines or queued messages, that holds a
    /// committed entry of that term bounds every future leader's log: an entry missing from
    /// its log is lost. A lost join quiesces the slot, a lost leave returns it to Connected.
    fn settle_transitions(&mut self) {
        let nodes = &self.cluster.nodes;
        let replicas: Vec<(usize, &E)> = nodes
            .iter()
            .zip(&self.engines)
            .filter(|(node, _)| node.is_active())
            .map(|(node, engine)| (node.slot, engine))
            .collect();

        let newest = replicas
            .iter()
            .map(|(_, engine)| engine.current_term())
            .chain(
                nodes
                    .iter()
                    .flat_map(|node| node.inbox.iter().map(|e| e.message.term())),
            )
            .max()
            .unwrap_or(0);
        let Some(witness) = replicas
            .iter()
            .find(|(_, engine)| {
                engine.is_leader()
                    && engine.current_term() == newest
                    && engine
                        .entry_at(engine.commit_index())
                        .map_or(false, |entry| entry.term == newest)
            })
            .map(|(slot, _)| *slot)
        else {
            return;
        };

        for slot in 0..self.cluster.nodes.len() {
            let node = &self.cluster.nodes[slot];
            let Some(entry_id) = node.transition else {
                continue;
            };
            if holds_entry(&self.engines[witness], entry_id) {
                continue;
            }

            let id = node.id;
            match node.status() {
                ConnectStatus::Connecting => {
                    tracing::debug!(slot, replica = id, "join lost");
                    self.quiesce(slot);
                }
                ConnectStatus::Disconnecting => {
                    tracing::debug!(slot, replica = id, "leave lost");
                    let node = &mut self.cluster.nodes[slot];
                    node.transition = None;
                    node.rollback();
                }
                _ => self.cluster.nodes[slot].transition = None,
            }
        }
    }

    /// Take `slot` out of the cluster: its engine is replaced by a dormant one and its
    /// identity stops routing.
    fn quiesce(&mut self, slot: usize) {
        let node = &mut self.cluster.nodes[slot];
        let id = node.id;
        if node.status() == ConnectStatus::Connecting {
            node.rollback();
        } else {
            node.retire();
        }
        node.inbox.clear();
        node.voting = false;
        node.transition = None;

        self.cluster.network.unregister(id);
        self.engines[slot] = E::new(EngineInit::new(id, Vec::new(), 0));
        self.cluster.stats.replicas_quiesced += 1;
        tracing::info!(slot, replica = id, "replica quiesced");
    }

    fn halt(&mut self, violation: Violation) -> SimError {
        self.halted = true;
        let failure = Failure {
            violation,
            diagnostics: self.diagnostics(),
        };
        tracing::error!("{failure}");
        SimError::Violation(Box::new(failure))
    }

    fn observe_leader(&mut self) {
        let Some(slot) = self.leader() else {
            return;
        };
        let id = self.cluster.nodes[slot].id;
        if self.last_leader != Some(id) {
            self.last_leader = Some(id);
            self.cluster.stats.leadership_changes += 1;
            tracing::info!(
                slot,
                replica = id,
                term = self.engines[slot].current_term(),
                "new leader"
            );
        }
    }

    fn service_dump_request(&self) {
        if self.dump.take() {
            tracing::warn!("dump requested\n{}", self.diagnostics());
        }
    }

    fn log_engine_error(&self, slot: usize, outcome: virtraft_core::Result<()>) {
        if let Err(err) = outcome {
            if !err.is_expected() {
                tracing::warn!(slot, %err, "engine error");
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.halted {
            Err(SimError::Halted)
        } else {
            Ok(())
        }
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        let nodes = self.cluster.nodes.len();
        if slot < nodes {
            Ok(())
        } else {
            Err(SimError::UnknownReplica { slot, nodes })
        }
    }

    fn next_entry_id(&mut self) -> EntryId {
        self.next_entry_id += 1;
        self.next_entry_id
    }

    fn fresh_id(&self) -> NodeId {
        loop {
            let id = self.cluster.rng.next_u32();
            if !self.used_ids.contains(&id) {
                return id;
            }
        }
    }
}

fn holds_entry<E: virtraft_core::Engine>(engine: &E, entry_id: EntryId) -> bool {
    (1..=engine.current_index())
        .rev()
        .any(|index| engine.entry_at(index).map_or(false, |entry| entry.id == entry_id))
}

fn engine_init(config: &SimConfig, rng: &SimRng, id: NodeId, members: Vec<Member>) -> EngineInit {
    EngineInit::new(id, members, rng.next_u64())
        .with_timeouts(config.timeouts)
        .with_max_append_entries(config.max_append_entries)
}

/// Builder for the reference-engine simulation.
#[derive(Debug, Default)]
pub struct SimulationBuilder {
    config: SimConfig,
}

impl SimulationBuilder {
    /// Set the random seed for deterministic execution.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set the number of nodes in the cluster.
    pub fn nodes(mut self, count: usize) -> Self {
        self.config.nodes = count;
        self
    }

    /// Set the fault injection configuration.
    pub fn faults(mut self, faults: FaultConfig) -> Self {
        self.config.faults = faults;
        self
    }

    /// Replace the whole configuration; later calls still apply on top.
    pub fn config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the simulation.
    pub fn build(self) -> Result<Simulation> {
        Simulation::new(self.config)
    }

    /// Build a simulation over another engine.
    pub fn build_with<E: virtraft_core::Engine>(self) -> Result<Simulation<E>> {
        Simulation::new(self.config)
    }
}
