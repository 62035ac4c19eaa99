//! Unit configuration

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        // Add jitter: 50% to 150% of the base duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Proposer and tally timing
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// How long a phase may wait for a majority before the round restarts.
    pub phase_timeout: Duration,
    /// How often the tallies scan for completed majorities.
    pub tally_interval: Duration,
    /// Extra delay added to restarted rounds.
    pub backoff: BackoffConfig,
    /// Seed for the jitter RNG; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(1),
            tally_interval: Duration::from_millis(50),
            backoff: BackoffConfig::default(),
            seed: None,
        }
    }
}

impl ProposerConfig {
    /// Same config with a fixed RNG seed for deterministic behavior
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub(crate) fn rng(&self) -> StdRng {
        self.seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64)
    }
}

/// Acceptor catch-up
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// How often peers are asked for commits this node missed.
    pub sync_interval: Duration,
    /// Most slots asked for, or answered, per sync message.
    pub sync_batch: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(1),
            sync_batch: 64,
        }
    }
}

/// Bully election timing
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a round waits for `Okay` or `Coordinator`.
    pub reply_timeout: Duration,
    /// How often a new round starts.
    pub poll_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_secs(6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for retries in 0..20 {
            let d = config.duration(retries, &mut rng);
            let base = (0.01 * 2f64.powi(retries.cast_signed())).min(1.0);
            assert!(d.as_secs_f64() >= base * 0.5 - 1e-9, "retry {retries}: {d:?}");
            assert!(d.as_secs_f64() <= base * 1.5 + 1e-9, "retry {retries}: {d:?}");
        }
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let config = ProposerConfig::default().with_seed(42);
        let a = config.backoff.duration(3, &mut config.rng());
        let b = config.backoff.duration(3, &mut config.rng());
        assert_eq!(a, b);
    }

    #[test]
    fn defaults_match_documented_timings() {
        let proposer = ProposerConfig::default();
        assert_eq!(proposer.phase_timeout, Duration::from_secs(1));
        assert_eq!(proposer.tally_interval, Duration::from_millis(50));
        let election = ElectionConfig::default();
        assert_eq!(election.reply_timeout, Duration::from_secs(3));
        assert_eq!(election.poll_interval, Duration::from_secs(6));
    }
}
