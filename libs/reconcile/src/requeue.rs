//! Jittered requeue windows.

use std::time::Duration;

use rand::Rng;

/// Picks a retry delay uniformly inside `[min, max]`.
///
/// Spreading retries keeps a burst of failing disruptions from hammering the
/// platform in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitteredRequeue {
    pub min: Duration,
    pub max: Duration,
}

impl Default for JitteredRequeue {
    fn default() -> Self {
        Self {
            min: crate::DEFAULT_REQUEUE_MIN,
            max: crate::DEFAULT_REQUEUE_MAX,
        }
    }
}

impl JitteredRequeue {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Draw the next delay from the thread-local RNG.
    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::rng())
    }

    /// Draw the next delay from the given RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let millis = rng.random_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window() {
        let requeue = JitteredRequeue::default();
        for _ in 0..200 {
            let delay = requeue.next_delay();
            assert!(delay >= Duration::from_secs(15));
            assert!(delay <= Duration::from_secs(20));
        }
    }

    #[test]
    fn test_degenerate_window() {
        let requeue = JitteredRequeue::new(Duration::from_secs(3), Duration::from_secs(3));
        assert_eq!(requeue.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_swapped_bounds() {
        let requeue = JitteredRequeue::new(Duration::from_secs(9), Duration::from_secs(2));
        assert_eq!(requeue.min, Duration::from_secs(2));
        assert_eq!(requeue.max, Duration::from_secs(9));
    }
}
