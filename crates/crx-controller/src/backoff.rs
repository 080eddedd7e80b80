//! Per-object failure backoff for the error policy
//!
//! Consecutive failures of the same object double the requeue delay, with
//! jitter, up to a cap. A successful pass resets the object's counter.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;

use crate::store::ObjectKey;

/// Backoff settings
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Tracks consecutive failures per object
#[derive(Debug, Default)]
pub struct FailureBackoff {
    config: BackoffConfig,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl FailureBackoff {
    /// Create a tracker with the given settings
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return the delay before its next attempt
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let attempt = {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let count = failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.config.base.as_secs_f64() * self.config.multiplier.powi(exponent);

        // Jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let max = self.config.max.as_secs_f64();
        Duration::from_secs_f64((delay * jitter).min(max))
    }

    /// Forget the failures of `key`
    pub fn reset(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
