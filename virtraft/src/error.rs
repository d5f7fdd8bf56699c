//! Error types for the simulation harness.

use thiserror::Error;

use crate::Failure;

/// Errors surfaced by the harness.
#[derive(Error, Debug)]
pub enum SimError {
    /// Invalid configuration, reported before any simulation state exists
    #[error("configuration error: {0}")]
    Config(String),

    /// A safety property was violated, the simulation is halted
    #[error("{0}")]
    Violation(Box<Failure>),

    /// The simulation already halted on a violation
    #[error("simulation halted after a safety violation")]
    Halted,

    /// A command named a replica slot the cluster does not have
    #[error("replica slot {slot} out of range (cluster has {nodes})")]
    UnknownReplica { slot: usize, nodes: usize },

    /// The command stream contained an unrecognized byte
    #[error("malformed command at byte {offset}: {byte:#04x}")]
    MalformedCommand { offset: usize, byte: u8 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// Check if this error reports a safety violation
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violation(_) | Self::Halted)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Violation(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, SimError>;
