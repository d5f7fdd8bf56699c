//! Deterministic random number generator for simulation.
//!
//! Every random decision of a run, harness and engines alike, comes out of one of these.
//! Same seed, same run.

use std::cell::Cell;

/// Seeded xorshift64 generator.
///
/// Takes `&self` so the harness can hand one shared reference to every component that draws
/// from it during a step.
#[derive(Debug)]
pub struct SimRng {
    state: Cell<u64>,
}

impl SimRng {
    /// Create a new generator. Seed 0 becomes 1 (xorshift needs a non-zero state).
    pub fn new(seed: u64) -> Self {
        let seed = if seed == 0 { 1 } else { seed };
        Self {
            state: Cell::new(seed),
        }
    }

    pub fn next_u64(&self) -> u64 {
        let mut x = self.state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.set(x);
        x
    }

    pub fn next_u32(&self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Random value in `[0, max)`, 0 when `max` is 0.
    pub fn below(&self, max: u64) -> u64 {
        if max == 0 {
            0
        } else {
            self.next_u64() % max
        }
    }

    /// Random index in `[0, max)`, 0 when `max` is 0.
    pub fn next_usize(&self, max: usize) -> usize {
        self.below(max as u64) as usize
    }

    /// True with probability `percent`%. Always draws, so the stream does not depend on
    /// the rate.
    pub fn chance(&self, percent: u8) -> bool {
        self.below(100) < u64::from(percent)
    }

    pub fn choose<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            None
        } else {
            items.get(self.next_usize(items.len()))
        }
    }

    /// Derive an independent generator, advancing this one past the child's seed.
    pub fn fork(&self) -> Self {
        let child_seed = self.next_u64();
        let _ = self.next_u64();
        Self::new(child_seed)
    }

    pub fn state(&self) -> u64 {
        self.state.get()
    }
}

impl Clone for SimRng {
    fn clone(&self) -> Self {
        Self {
            state: Cell::new(self.state.get()),
        }
    }
}
