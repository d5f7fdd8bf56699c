//! Fault injection configuration for simulation.
//!
//! Rates are whole percentages in `[0, 100]`, matching the `--*-rate` CLI options.

use serde::Serialize;

use crate::{Result, SimError};

/// Per-message and per-tick fault rates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FaultConfig {
    /// Chance a sent message is silently discarded.
    pub drop_rate: u8,

    /// Chance of enqueuing one more copy, drawn again after every copy.
    pub dupe_rate: u8,

    /// Chance per replica per tick of flipping its partition flag.
    pub partition_rate: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl FaultConfig {
    /// Perfectly reliable network.
    pub fn none() -> Self {
        Self {
            drop_rate: 0,
            dupe_rate: 0,
            partition_rate: 0,
        }
    }

    /// Occasional loss and duplication.
    pub fn lossy() -> Self {
        Self {
            drop_rate: 5,
            dupe_rate: 5,
            partition_rate: 0,
        }
    }

    /// Heavy loss, duplication and flapping partitions.
    pub fn chaos() -> Self {
        Self {
            drop_rate: 20,
            dupe_rate: 10,
            partition_rate: 1,
        }
    }

    pub fn with_drop_rate(mut self, rate: u8) -> Self {
        self.drop_rate = rate.min(100);
        self
    }

    /// Duplication is capped below 100 so the copy loop always ends.
    pub fn with_dupe_rate(mut self, rate: u8) -> Self {
        self.dupe_rate = rate.min(99);
        self
    }

    pub fn with_partition_rate(mut self, rate: u8) -> Self {
        self.partition_rate = rate.min(100);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.drop_rate > 100 {
            return Err(SimError::Config(format!(
                "drop rate {} is above 100",
                self.drop_rate
            )));
        }
        if self.dupe_rate >= 100 {
            return Err(SimError::Config(format!(
                "dupe rate {} must be below 100",
                self.dupe_rate
            )));
        }
        if self.partition_rate > 100 {
            return Err(SimError::Config(format!(
                "partition rate {} is above 100",
                self.partition_rate
            )));
        }
        Ok(())
    }
}
