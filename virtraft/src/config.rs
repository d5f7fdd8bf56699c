//! Simulation configuration.

use serde::Serialize;
use virtraft_core::Timeouts;

use crate::{FaultConfig, FsmKind, Result, SimError};

/// How far replica clocks advance per timed tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeriodConfig {
    /// Draw a random advance in `[0, max_tick_ms)` instead of the fixed period.
    pub random: bool,

    pub max_tick_ms: u64,

    /// Used when `random` is off, and always by scripted `perid` commands.
    pub fixed_ms: u64,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            random: true,
            max_tick_ms: 200,
            fixed_ms: 500,
        }
    }
}

/// Everything a run depends on besides the engine type.
///
/// Two runs with equal configs produce identical statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SimConfig {
    /// Replica slots in the cluster.
    pub nodes: usize,

    pub seed: u64,

    /// Tick bound for [`Simulation::run_configured`](crate::Simulation::run_configured),
    /// `None` runs until interrupted.
    pub iterations: Option<u64>,

    pub faults: FaultConfig,

    /// Chance per tick of proposing a client entry at the leader.
    pub client_rate: u8,

    /// Chance per replica per tick of toggling its membership.
    pub membership_rate: u8,

    pub period: PeriodConfig,

    pub timeouts: Timeouts,

    pub max_append_entries: usize,

    pub fsm: FsmKind,

    pub fsm_cells: usize,

    pub check_log_matching: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            seed: 0,
            iterations: None,
            faults: FaultConfig::none(),
            client_rate: 100,
            membership_rate: 0,
            period: PeriodConfig::default(),
            timeouts: Timeouts::default(),
            max_append_entries: 64,
            fsm: FsmKind::Accumulator,
            fsm_cells: 16,
            check_log_matching: true,
        }
    }
}

impl SimConfig {
    pub fn new(nodes: usize, seed: u64) -> Self {
        Self {
            nodes,
            seed,
            ..Self::default()
        }
    }

    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_client_rate(mut self, rate: u8) -> Self {
        self.client_rate = rate.min(100);
        self
    }

    pub fn with_membership_rate(mut self, rate: u8) -> Self {
        self.membership_rate = rate.min(100);
        self
    }

    pub fn with_iterations(mut self, iterations: Option<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Advance clocks by the fixed period instead of a random amount.
    pub fn with_fixed_period(mut self) -> Self {
        self.period.random = false;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_fsm(mut self, fsm: FsmKind, cells: usize) -> Self {
        self.fsm = fsm;
        self.fsm_cells = cells;
        self
    }

    pub fn with_log_matching(mut self, enabled: bool) -> Self {
        self.check_log_matching = enabled;
        self
    }

    /// Clock advance for one fuzz tick.
    pub(crate) fn tick_ms(&self, rng: &virtraft_core::SimRng) -> u64 {
        if self.period.random {
            rng.below(self.period.max_tick_ms)
        } else {
            self.period.fixed_ms
        }
    }

    /// Validate the configuration.
    ///
    /// # Checks
    ///
    /// - At least one replica
    /// - Rates within `[0, 100]`, duplication below 100
    /// - Non-zero timeouts, tick bound, batch size and cell count
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(SimError::Config("cluster needs at least one node".into()));
        }

        self.faults.validate()?;

        if self.client_rate > 100 {
            return Err(SimError::Config(format!(
                "client rate {} is above 100",
                self.client_rate
            )));
        }
        if self.membership_rate > 100 {
            return Err(SimError::Config(format!(
                "membership rate {} is above 100",
                self.membership_rate
            )));
        }

        if self.timeouts.election_ms == 0 {
            return Err(SimError::Config(
                "election timeout must be positive".into(),
            ));
        }
        if self.timeouts.request_ms == 0 {
            return Err(SimError::Config("request timeout must be positive".into()));
        }
        if self.period.random && self.period.max_tick_ms == 0 {
            return Err(SimError::Config("max tick must be positive".into()));
        }
        if self.max_append_entries == 0 {
            return Err(SimError::Config(
                "append batch must carry at least one entry".into(),
            ));
        }
        if self.fsm_cells == 0 {
            return Err(SimError::Config("state machine needs at least one cell".into()));
        }

        Ok(())
    }
}
