//! Adaptive result timeout
//!
//! Tracks a sliding window of observed round-trip latencies per detector.
//! Until enough samples exist the initial timeout applies; afterwards the
//! timeout is `max(initial, p95 * multiplier)`, capped at the maximum.
//!
//! A timeout is evidence too: it raises a floor to twice the wait that
//! expired, so a detector slower than the initial timeout gets a longer
//! wait on its next job instead of failing forever. Successes only lower
//! the floor, down to `latency * multiplier`.

use std::collections::VecDeque;
use std::time::Duration;

/// Factor applied to an expired wait to get the next floor
const TIMEOUT_BACKOFF: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    initial: Duration,
    max: Duration,
    window: usize,
    min_samples: usize,
    multiplier: f64,
    samples: VecDeque<Duration>,
    floor: Duration,
}

impl AdaptiveTimeout {
    pub fn new(initial: Duration, max: Duration, window: usize, min_samples: usize, multiplier: f64) -> Self {
        let window = window.max(1);
        Self {
            initial,
            max: max.max(initial),
            window,
            min_samples: min_samples.clamp(1, window),
            multiplier: if multiplier.is_finite() && multiplier > 0.0 { multiplier } else { 1.0 },
            samples: VecDeque::with_capacity(window),
            floor: Duration::ZERO,
        }
    }

    /// Record one successful round-trip
    pub fn observe(&mut self, latency: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
        self.floor = self.floor.min(latency.mul_f64(self.multiplier));
    }

    /// Record a job that got no answer within `waited`
    pub fn observe_timeout(&mut self, waited: Duration) {
        self.floor = self.floor.max(waited.mul_f64(TIMEOUT_BACKOFF)).min(self.max);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// 95th percentile of the window (nearest rank)
    pub fn p95(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() * 95).div_ceil(100);
        sorted.get(rank.saturating_sub(1)).copied()
    }

    /// Timeout to apply to the next job
    pub fn current(&self) -> Duration {
        let adapted = match self.p95() {
            Some(p95) if self.samples.len() >= self.min_samples => p95.mul_f64(self.multiplier),
            _ => self.initial,
        };
        adapted.max(self.floor).clamp(self.initial, self.max)
    }
}
