//! Deterministic exponential backoff with symmetric jitter and an idle reset.
//!
//! Rather than scheduling a real timer task to zero the attempt counter,
//! elapsed wall-clock time is checked lazily on the next `duration()` call.

use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for a [`BackoffManager`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fraction of uniform symmetric noise, clamped to `(0, 1]`.
    pub jitter: f64,
    pub reset_duration: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(800),
            max: Duration::from_millis(15_000),
            factor: 1.5,
            jitter: 0.1,
            reset_duration: Duration::from_millis(60_000),
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn min(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }

    #[must_use]
    pub fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    #[must_use]
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(f64::EPSILON, 1.0);
        self
    }

    #[must_use]
    pub fn reset_duration(mut self, reset_duration: Duration) -> Self {
        self.reset_duration = reset_duration;
        self
    }

    fn max_attempt(&self) -> u32 {
        let ratio = self.max.as_secs_f64() / self.min.as_secs_f64();
        (ratio.ln() / self.factor.ln()).floor() as u32
    }
}

/// Produces monotonic retry delays with jitter, auto-resetting after a quiet interval.
pub struct BackoffManager {
    config: BackoffConfig,
    attempt: u32,
    /// Behind a lock (rather than plain `Option<Instant>`) so that
    /// [`BackoffManager::clear_timeout`] can cancel the pending idle-reset
    /// from `&self` — needed because `Reflector::stop` only holds `&self`.
    last_duration_at: Mutex<Option<Instant>>,
}

impl BackoffManager {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_duration_at: Mutex::new(None),
        }
    }

    /// Computes the next retry delay, advancing the internal attempt counter.
    ///
    /// If more than [`BackoffConfig::reset_duration`] has elapsed since the
    /// last call, the attempt counter is zeroed first (an idle reflector that
    /// starts failing again should not inherit its previous backoff streak).
    pub fn duration(&mut self) -> Duration {
        let now = Instant::now();
        let mut last_duration_at = self.last_duration_at.lock();
        if let Some(last) = *last_duration_at {
            if now.saturating_duration_since(last) > self.config.reset_duration {
                tracing::debug!("backoff idle window elapsed, resetting attempt counter");
                self.attempt = 0;
            }
        }
        *last_duration_at = Some(now);
        drop(last_duration_at);

        let attempt = self.attempt;
        self.attempt = self.attempt.saturating_add(1);

        if attempt > self.config.max_attempt() {
            return self.config.max;
        }

        let base = self.config.min.as_millis() as f64 * self.config.factor.powi(attempt as i32);
        let jittered = if self.config.jitter == 0.0 {
            base
        } else {
            let r: f64 = rand::rng().random_range(0.0..1.0);
            base * (1.0 + self.config.jitter * (2.0 * r - 1.0))
        };
        let millis = jittered.floor().max(0.0) as u64;
        Duration::from_millis(millis).min(self.config.max)
    }

    /// Resets the attempt counter to zero without affecting the idle clock.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Cancels the pending idle-reset window, as if `duration()` had never been called.
    ///
    /// Takes `&self`, not `&mut self`: [`crate::reflector::Reflector::stop`]
    /// is itself `&self` (it must be callable concurrently with `run()`), so
    /// this needs to reach the idle clock without exclusive access.
    pub fn clear_timeout(&self) {
        *self.last_duration_at.lock() = None;
    }

    #[cfg(test)]
    pub(crate) fn has_pending_reset(&self) -> bool {
        self.last_duration_at.lock().is_some()
    }
}
