//! Scheduler parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::SchedulerError;
use crate::trigger::{tick_probability, MAX_TICK_PROBABILITY};

pub const DEFAULT_TICK_MS: u64 = 250;
pub const DEFAULT_CHANNELS: usize = 8;
pub const SEED_ENV: &str = "CUEBOX_SEED";

/// What pressing the key of the already active theme does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactivatePolicy {
    /// Keep audio running, reset history, cooldowns and trigger state.
    #[default]
    Restart,
    /// Stop the theme and go idle.
    Deactivate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub channels: usize,
    /// Fixed RNG seed. `None` seeds from the OS.
    pub seed: Option<u64>,
    pub reactivate: ReactivatePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            channels: DEFAULT_CHANNELS,
            seed: None,
            reactivate: ReactivatePolicy::Restart,
        }
    }
}

impl SchedulerConfig {
    /// Tick length in seconds.
    pub fn dt(&self) -> f64 {
        self.tick.as_secs_f64()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_reactivate(mut self, policy: ReactivatePolicy) -> Self {
        self.reactivate = policy;
        self
    }

    /// Apply `CUEBOX_SEED` if set and numeric.
    pub fn apply_env(mut self) -> Self {
        if let Ok(raw) = std::env::var(SEED_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(seed) => self.seed = Some(seed),
                Err(_) => log::warn!("cuebox: ignoring non-numeric {}={:?}", SEED_ENV, raw),
            }
        }
        self
    }

    /// Check these parameters against a catalog.
    pub fn validate(&self, catalog: &Catalog) -> Result<(), SchedulerError> {
        if self.tick.is_zero() {
            return Err(SchedulerError::ZeroTick);
        }
        if self.channels == 0 {
            return Err(SchedulerError::NoChannels);
        }
        let dt = self.dt();
        for theme in catalog.themes() {
            for cue in theme.effects.iter().filter(|c| !c.looped) {
                let probability = tick_probability(cue.occurrence, theme.basetime, dt);
                if probability > MAX_TICK_PROBABILITY {
                    return Err(SchedulerError::TickTooCoarse {
                        theme: theme.name.clone(),
                        effect: cue.name.clone(),
                        probability,
                        max: MAX_TICK_PROBABILITY,
                    });
                }
            }
        }
        Ok(())
    }
}
