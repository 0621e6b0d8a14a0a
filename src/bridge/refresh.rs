//! Scheduled register refresh
//!
//! Some registers (fan speed on most firmwares) are never reported
//! unsolicited, so they are queried once shortly after startup and then on a
//! fixed interval whenever the cached value is missing or stale.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::cache::RegisterCache;
use super::policy::StalenessPolicy;
use crate::bus::Register;
use crate::config::TimingConfig;

#[derive(Clone, Copy, Debug)]
pub struct RefreshSchedule {
    pub startup_delay: Duration,
    pub interval: Duration,
}

impl From<&TimingConfig> for RefreshSchedule {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            startup_delay: timing.startup_delay(),
            interval: timing.refresh_interval(),
        }
    }
}

impl RefreshSchedule {
    /// First tick after `startup_delay`, then every `interval`
    pub fn timer(&self) -> Interval {
        let mut timer = tokio::time::interval_at(Instant::now() + self.startup_delay, self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }
}

/// Registers that need a query on this refresh pass.
///
/// With raw passthrough enabled every register seen so far is refreshed too.
pub fn due_registers(
    well_known: impl IntoIterator<Item = Register>,
    cache: &RegisterCache,
    policy: &StalenessPolicy,
    include_cached: bool,
    now: Instant,
) -> Vec<Register> {
    let mut candidates: BTreeSet<Register> = well_known.into_iter().collect();
    if include_cached {
        candidates.extend(cache.registers());
    }

    candidates
        .into_iter()
        .filter(|r| policy.is_stale(cache.lookup(*r), now))
        .collect()
}

/// Queries the bridge has sent and not yet seen answered
#[derive(Debug)]
pub struct OutstandingQueries {
    issued: HashMap<Register, Instant>,
    timeout: Duration,
}

impl OutstandingQueries {
    pub fn new(timeout: Duration) -> Self {
        Self {
            issued: HashMap::new(),
            timeout,
        }
    }

    pub fn mark(&mut self, register: Register, now: Instant) {
        self.issued.insert(register, now);
    }

    pub fn is_outstanding(&self, register: Register, now: Instant) -> bool {
        self.issued
            .get(&register)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.timeout)
    }

    pub fn clear(&mut self, register: Register) {
        self.issued.remove(&register);
    }
}
