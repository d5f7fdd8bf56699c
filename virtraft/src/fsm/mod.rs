//! Deterministic replica state machines.
//!
//! Every replica owns one state machine, fed the commands of committed normal entries in
//! log order. Replicas that applied the same prefix must hold identical cells.

mod accumulator;
mod kvstore;

use std::fmt::Debug;

use serde::Serialize;
use thiserror::Error;
use virtraft_core::SimRng;

pub use accumulator::{Accumulator, AccumulatorCommand, AccumulatorOp};
pub use kvstore::{KeyValue, KvCommand, KvOp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("undecodable command: {0}")]
    Decode(String),

    #[error("cell {cell} out of range ({cells} cells)")]
    CellOutOfRange { cell: u32, cells: usize },

    #[error("mapping index {0} out of range")]
    MappingOutOfRange(u32),
}

/// A replica state machine.
pub trait StateMachine: Debug {
    fn kind(&self) -> FsmKind;

    /// Apply one encoded command.
    fn apply(&mut self, command: &[u8]) -> Result<(), FsmError>;

    /// Encode a uniformly sampled command.
    fn random_command(&self, rng: &SimRng) -> Vec<u8>;

    fn cells(&self) -> &[i64];
}

/// Which state machine every replica of a run uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum FsmKind {
    Accumulator,
    KeyValue,
}

impl FsmKind {
    pub fn build(&self, cells: usize) -> Box<dyn StateMachine> {
        match self {
            Self::Accumulator => Box::new(Accumulator::new(cells)),
            Self::KeyValue => Box::new(KeyValue::new(cells)),
        }
    }
}

impl std::str::FromStr for FsmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accumulator" | "acc" => Ok(Self::Accumulator),
            "kv" | "keyvalue" | "key-value" => Ok(Self::KeyValue),
            other => Err(format!("unknown state machine `{other}`")),
        }
    }
}

fn decode<T>(command: &[u8]) -> Result<T, FsmError>
where
    T: for<'a> bitcode::Decode<'a>,
{
    bitcode::decode(command).map_err(|e| FsmError::Decode(e.to_string()))
}

fn cell_index(cell: u32, cells: usize) -> Result<usize, FsmError> {
    let index = cell as usize;
    if index < cells {
        Ok(index)
    } else {
        Err(FsmError::CellOutOfRange { cell, cells })
    }
}
