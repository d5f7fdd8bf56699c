//! Deterministic simulation and model checking for consensus clusters.
//!
//! virtraft drives N engine instances through a simulated lossy network, injects faults
//! (drops, duplicates, partitions, membership churn) and checks the cluster against core
//! consensus safety properties after every step. Every decision comes out of one seeded
//! [`SimRng`], so a run is fully reproducible from `(seed, config)`.
//!
//! # Modes
//!
//! - **Fuzz**: [`Simulation::run`] executes randomized ticks.
//! - **Scripted**: [`Simulation::run_script`] replays a byte stream of [`Command`] words.
//!
//! # Example
//!
//! ```rust,ignore
//! use virtraft::{FaultConfig, Simulation};
//!
//! let mut sim = Simulation::builder()
//!     .seed(42)
//!     .nodes(5)
//!     .faults(FaultConfig::lossy())
//!     .build()?;
//!
//! sim.run(1000)?;
//! println!("{}", sim.stats().render_plain());
//! ```
//!
//! # Safety properties
//!
//! - **Election safety**: two leaders never share a term
//! - **Leader completeness**: the entry at each commit index is held by a voting majority
//! - **Log matching**: logs agreeing on `(index, term)` agree on every earlier entry
//! - **State machine safety**: the [`CommitLedger`] never sees two entries committed at one index
//!
//! A violation halts the simulation and surfaces as [`SimError::Violation`] carrying the
//! per-replica [`Diagnostics`] taken at that moment.

mod callbacks;
mod checker;
mod command;
mod config;
mod diagnostics;
mod error;
mod faults;
mod fsm;
mod harness;
mod ledger;
mod membership;
mod network;
mod node;
mod stats;
#[cfg(test)]
mod testing;

pub use checker::{CheckResult, InvariantChecker, Violation, ViolationType};
pub use command::{Command, CommandParser, CommandReader, Feed};
pub use config::{PeriodConfig, SimConfig};
pub use diagnostics::{Diagnostics, Failure, ReplicaDiagnostics};
pub use error::{Result, SimError};
pub use faults::FaultConfig;
pub use fsm::{
    Accumulator, AccumulatorCommand, AccumulatorOp, FsmError, FsmKind, KeyValue, KvCommand, KvOp,
    StateMachine,
};
pub use harness::{DumpRequest, Simulation, SimulationBuilder, ToggleOutcome};
pub use ledger::{CommitLedger, LedgerCheck, LedgerEntry};
pub use network::{Envelope, VirtualNetwork};
pub use node::{ConnectStatus, Node, StatusChange};
pub use stats::{NetworkStats, SimStats};

pub use virtraft_core::{Engine, NodeId, SimRng, Timeouts};
pub use virtraft_raft::RaftEngine;
