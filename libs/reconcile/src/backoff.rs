//! Bounded exponential backoff.

use std::time::Duration;

use rand::Rng;

/// A source of successive wait intervals.
pub trait Backoff {
    /// The next delay, or `None` once the budget is spent.
    fn next_delay(&mut self) -> Option<Duration>;

    /// Start over from the first interval.
    fn reset(&mut self);
}

/// Exponential backoff with a per-interval cap and a total elapsed budget.
///
/// Elapsed time is accounted from the delays handed out, not wall clock, so
/// the sequence is reproducible in tests.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First interval.
    pub initial: Duration,

    /// Growth between intervals, in percent of the previous one.
    pub growth_percent: u32,

    /// Jitter factor (0.0 to 1.0) applied symmetrically around each interval.
    pub jitter: f64,

    /// Largest single interval.
    pub max_interval: Duration,

    /// Total budget across all intervals.
    pub max_elapsed: Duration,

    current: Duration,
    elapsed: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(100),
            crate::DEFAULT_BACKOFF_MAX_INTERVAL,
            crate::DEFAULT_BACKOFF_MAX_ELAPSED,
        )
    }
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial`.
    pub fn new(initial: Duration, max_interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial,
            growth_percent: 150,
            jitter: 0.25,
            max_interval,
            max_elapsed,
            current: initial,
            elapsed: Duration::ZERO,
        }
    }

    /// Disable jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Time handed out so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        if self.elapsed >= self.max_elapsed {
            return None;
        }

        let base = self.current.min(self.max_interval);
        let delay = if self.jitter > 0.0 {
            let spread = base.as_secs_f64() * self.jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
        } else {
            base
        }
        .min(self.max_interval)
        .min(self.max_elapsed - self.elapsed);

        self.elapsed += delay;
        self.current = (base * self.growth_percent / 100).min(self.max_interval);

        Some(delay)
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.elapsed = Duration::ZERO;
    }
}
