//! Reconnect backoff
//!
//! Each delay is the current base plus up to `jitter * base` of random slack,
//! capped at the ceiling. The base then grows by the multiplier.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::BackoffConfig;

#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    base: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::from_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            base: config.initial,
            config,
            rng,
        }
    }

    /// Base the next delay is computed from
    pub fn current(&self) -> Duration {
        self.base
    }

    pub fn next_delay(&mut self) -> Duration {
        let max = self.config.max;
        let base = self.base;
        let spread = scale(base, self.config.jitter, max);
        let slack = if spread.is_zero() {
            Duration::ZERO
        } else {
            scale(spread, self.rng.gen::<f64>(), max)
        };

        self.base = scale(base, self.config.multiplier, max);
        base.saturating_add(slack).min(max)
    }

    pub fn reset(&mut self) {
        self.base = self.config.initial;
    }
}

/// `duration * factor`, saturating at `max`
fn scale(duration: Duration, factor: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).map_or(max, |d| d.min(max))
}
