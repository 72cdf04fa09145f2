//! Exponential backoff for recovery retries

use std::time::Duration;

use rand::Rng;

/// Exponential backoff strategy for retrying unresolved branches.
///
/// Delays grow exponentially with each attempt up to a maximum, with optional
/// jitter so several coordinators do not retry in lockstep.
///
/// # Example
///
/// ```
/// use xapool_connection::recovery::BackoffStrategy;
/// use std::time::Duration;
///
/// let backoff = BackoffStrategy::new(100, 30_000);
/// assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
/// assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
/// assert!(backoff.calculate_delay(20) <= Duration::from_millis(30_000));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: bool,
}

impl BackoffStrategy {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial_ms = initial_ms.max(1);
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Backoff for a recovery interval: starts at a tenth of it, capped at the interval
    pub fn for_interval(interval: Duration) -> Self {
        let max_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self::new(max_ms / 10, max_ms).with_jitter(true)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Spread delays by up to 25% either way
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the given zero-based attempt
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = (self.initial_ms as f64) * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_ms as f64) as u64;

        let final_ms = if self.jitter {
            let spread = capped_ms / 4;
            let offset = rand::thread_rng().gen_range(0..=spread * 2);
            capped_ms.saturating_sub(spread).saturating_add(offset)
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn has_jitter(&self) -> bool {
        self.jitter
    }
}

impl Default for BackoffStrategy {
    /// 100ms initial, 30 seconds max, 2x multiplier
    fn default() -> Self {
        Self::new(100, 30_000)
    }
}
