use virtraft_core::SimRng;

use super::{cell_index, decode, FsmError, FsmKind, StateMachine};

/// Exclusive upper bound of sampled values.
const MAX_VALUE: u64 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub enum KvOp {
    Set,
    /// Reads have no observable effect on the cells.
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub struct KvCommand {
    pub op: KvOp,
    pub cell: u32,
    pub value: i64,
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        bitcode::encode(self)
    }
}

/// Fixed slots overwritten by `Set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    cells: Vec<i64>,
}

impl KeyValue {
    pub fn new(cells: usize) -> Self {
        Self {
            cells: vec![0; cells],
        }
    }

    pub fn execute(&mut self, command: KvCommand) -> Result<(), FsmError> {
        let index = cell_index(command.cell, self.cells.len())?;
        if command.op == KvOp::Set {
            self.cells[index] = command.value;
        }
        Ok(())
    }
}

impl StateMachine for KeyValue {
    fn kind(&self) -> FsmKind {
        FsmKind::KeyValue
    }

    fn apply(&mut self, command: &[u8]) -> Result<(), FsmError> {
        self.execute(decode(command)?)
    }

    fn random_command(&self, rng: &SimRng) -> Vec<u8> {
        let op = if rng.chance(50) { KvOp::Set } else { KvOp::Get };
        KvCommand {
            op,
            value: rng.below(MAX_VALUE) as i64,
            cell: rng.below(self.cells.len() as u64) as u32,
        }
        .encode()
    }

    fn cells(&self) -> &[i64] {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_overwrites() {
        let mut fsm = KeyValue::new(3);
        fsm.execute(KvCommand {
            op: KvOp::Set,
            cell: 1,
            value: 9,
        })
        .unwrap();
        fsm.execute(KvCommand {
            op: KvOp::Set,
            cell: 1,
            value: 4,
        })
        .unwrap();
        assert_eq!(fsm.cells(), &[0, 4, 0]);
    }

    #[test]
    fn test_get_is_a_no_op() {
        let mut fsm = KeyValue::new(3);
        fsm.execute(KvCommand {
            op: KvOp::Get,
            cell: 2,
            value: 77,
        })
        .unwrap();
        assert_eq!(fsm, KeyValue::new(3));
    }

    #[test]
    fn test_random_values_in_range() {
        let rng = SimRng::new(3);
        let mut fsm = KeyValue::new(4);
        for _ in 0..500 {
            let command = fsm.random_command(&rng);
            fsm.apply(&command).unwrap();
        }
        assert!(fsm.cells().iter().all(|v| (0..255).contains(v)));
    }
}
