use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff with ±50% jitter. The base delay grows by
/// `backoff_factor` after every attempt and is capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    /// The next attempt runs without delay.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// The next attempt waits the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    /// Returns the delay for the next attempt and advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered(self.current_base, rng);

        self.current_base = if self.current_base.is_zero() {
            self.config.initial_delay
        } else {
            self.current_base.mul_f64(self.config.backoff_factor)
        }
        .min(self.config.max_delay);

        delay
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let base_millis = base.as_millis() as f64;
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((base_millis + jitter).round().max(0.0) as u64)
}
