// Adaptive polling interval: snap back to base while work is observed,
// back off exponentially toward a ceiling while idle.

use std::time::Duration;

/// Multiplier applied to the interval on every idle cycle.
const GROWTH_FACTOR: u32 = 2;
/// Ceiling of the adaptive interval, as a multiple of the base interval.
const MAX_INTERVAL_MULTIPLIER: u32 = 10;

/// Scheduling policy consulted by periodic loops between cycles.
pub trait IntervalPolicy: Send {
    /// A cycle did productive work: return to the base interval.
    fn evaluate(&mut self);

    /// A cycle found nothing to do: grow the interval toward the maximum.
    fn reset(&mut self);

    /// Current interval.
    fn interval(&self) -> Duration;

    /// Upper bound the interval never exceeds.
    fn max_interval(&self) -> Duration;
}

/// Exponential backoff bounded by `[base, base * 10]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoffPolicy {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self::with_max(base, base.saturating_mul(MAX_INTERVAL_MULTIPLIER))
    }

    /// Policy with an explicit ceiling. A ceiling below `base` is raised to `base`.
    pub fn with_max(base: Duration, max: Duration) -> Self {
        Self { base, current: base, max: max.max(base) }
    }

    pub fn base_interval(&self) -> Duration {
        self.base
    }
}

impl IntervalPolicy for ExponentialBackoffPolicy {
    fn evaluate(&mut self) {
        self.current = self.base;
    }

    fn reset(&mut self) {
        self.current = self.current.saturating_mul(GROWTH_FACTOR).min(self.max);
    }

    fn interval(&self) -> Duration {
        self.current
    }

    fn max_interval(&self) -> Duration {
        self.max
    }
}
