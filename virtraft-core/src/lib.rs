//! Engine contract for the virtraft consensus simulator.
//!
//! This crate defines everything a consensus engine and the simulation harness agree on:
//!
//! - **Log entries** ([`Entry`], [`EntryKind`], [`ConfigChange`]) with their cfg-change payload
//! - **Protocol messages** ([`Message`]) exchanged between replicas
//! - **The engine trait** ([`Engine`]) driven by the harness, and the [`Callbacks`] trait the
//!   engine calls back into while it runs
//! - **A deterministic generator** ([`SimRng`]) shared by engines and the harness so a whole
//!   run is reproducible from one seed
//!
//! # Driving an engine
//!
//! The harness owns every engine and calls it one step at a time. During a step the engine
//! may call [`Callbacks::send`], [`Callbacks::apply_entry`] and the log hooks synchronously.
//! Callbacks never re-enter the engine.
//!
//! ```rust,ignore
//! let mut engine = RaftEngine::new(EngineInit::new(0, members, seed));
//! engine.tick(120, &mut callbacks)?;
//! let resp = engine.recv_request_vote(1, request, &mut callbacks)?;
//! ```

mod engine;
mod entry;
mod error;
mod message;
mod rng;

pub use engine::*;
pub use entry::*;
pub use error::*;
pub use message::*;
pub use rng::SimRng;

/// Stable replica identity.
pub type NodeId = u32;

/// Election epoch.
pub type Term = u64;

/// Position in the replicated log. Indices start at 1, 0 means "no entry".
pub type Index = u64;

/// Identity the harness stamps on every proposed entry.
pub type EntryId = u64;
