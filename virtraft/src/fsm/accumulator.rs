use virtraft_core::SimRng;

use super::{cell_index, decode, FsmError, FsmKind, StateMachine};

/// Increments drawn by mapping index.
const TABLE: [i64; 5] = [5, 3, 1, 4, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub enum AccumulatorOp {
    Apply,
    ApplyInverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub struct AccumulatorCommand {
    pub op: AccumulatorOp,
    pub cell: u32,
    pub mapping: u32,
}

impl AccumulatorCommand {
    pub fn encode(&self) -> Vec<u8> {
        bitcode::encode(self)
    }
}

/// Integer cells moved up and down by table increments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulator {
    cells: Vec<i64>,
}

impl Accumulator {
    pub fn new(cells: usize) -> Self {
        Self {
            cells: vec![0; cells],
        }
    }

    pub fn execute(&mut self, command: AccumulatorCommand) -> Result<(), FsmError> {
        let index = cell_index(command.cell, self.cells.len())?;
        let delta = TABLE
            .get(command.mapping as usize)
            .copied()
            .ok_or(FsmError::MappingOutOfRange(command.mapping))?;

        match command.op {
            AccumulatorOp::Apply => self.cells[index] += delta,
            AccumulatorOp::ApplyInverse => self.cells[index] -= delta,
        }
        Ok(())
    }
}

impl StateMachine for Accumulator {
    fn kind(&self) -> FsmKind {
        FsmKind::Accumulator
    }

    fn apply(&mut self, command: &[u8]) -> Result<(), FsmError> {
        self.execute(decode(command)?)
    }

    fn random_command(&self, rng: &SimRng) -> Vec<u8> {
        let op = if rng.chance(50) {
            AccumulatorOp::Apply
        } else {
            AccumulatorOp::ApplyInverse
        };
        AccumulatorCommand {
            op,
            mapping: rng.below(TABLE.len() as u64) as u32,
            cell: rng.below(self.cells.len() as u64) as u32,
        }
        .encode()
    }

    fn cells(&self) -> &[i64] {
        &self.cells
    }
}
