//! Reference Raft engine for virtraft.
//!
//! [`RaftEngine`] implements [`virtraft_core::Engine`]: leader election with randomized
//! timeouts, log replication with conflict truncation, single-server membership changes with
//! non-voting members, and in-order application of committed entries.
//!
//! The engine is purely reactive. It owns no clock and no sockets; the harness advances it
//! with [`Engine::tick`](virtraft_core::Engine::tick) and feeds it messages, and every side
//! effect goes through [`Callbacks`](virtraft_core::Callbacks).

mod engine;
mod log;
mod membership;

pub use engine::RaftEngine;
pub use log::Log;
pub use membership::Membership;
