//! Backoff policy: decides how long a retry campaign waits between attempts
//! and when it gives up.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::BridgeError;

/// Exponential backoff configuration.
///
/// The policy itself is immutable; every retry campaign calls [`start`] to get
/// its own [`Backoff`] state.
///
/// [`start`]: BackoffPolicy::start
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt.
    pub initial_interval: Duration,

    /// Growth factor applied per step.
    pub multiplier: f64,

    /// Upper bound for a single wait.
    pub max_interval: Duration,

    /// Budget for the whole campaign.
    pub max_elapsed_time: Duration,
}

impl BackoffPolicy {
    /// Publishing defaults: 1s, x2, capped at 15s, give up after a minute.
    pub fn publisher_default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(15),
            max_elapsed_time: Duration::from_secs(60),
        }
    }

    /// Subscribing defaults: 1s, x2, capped at 30s, give up after three minutes.
    pub fn consumer_default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(180),
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        // zero waits would turn every retry loop into a busy loop
        if self.initial_interval.is_zero() || self.max_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "backoff intervals must be positive".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BridgeError::InvalidConfig(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_interval < self.initial_interval {
            return Err(BridgeError::InvalidConfig(
                "backoff max_interval is smaller than initial_interval".into(),
            ));
        }
        Ok(())
    }

    /// Wait for step `k` (0-indexed): `min(initial * multiplier^k, max_interval)`.
    pub fn interval(&self, step: u32) -> Duration {
        let base_secs = self.initial_interval.as_secs_f64();
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        let secs = base_secs * self.multiplier.powi(exponent);
        let max_secs = self.max_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max_secs {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs)
    }

    /// Begin a new retry campaign.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            step: 0,
            started_at: None,
            handed_out: Duration::ZERO,
            stopped: false,
        }
    }
}

/// State of one retry campaign.
///
/// Elapsed time counts from the first [`next`](Backoff::next) call and is the
/// larger of the wall-clock time and the sum of waits already handed out, so a
/// campaign stops even when its caller never actually sleeps.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    step: u32,
    started_at: Option<Instant>,
    handed_out: Duration,
    stopped: bool,
}

impl Backoff {
    /// Next wait, or `None` once the budget is spent. `None` is sticky.
    pub fn next(&mut self) -> Option<Duration> {
        if self.stopped {
            return None;
        }

        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        let elapsed = started_at.elapsed().max(self.handed_out);
        if elapsed > self.policy.max_elapsed_time {
            self.stopped = true;
            return None;
        }

        let wait = self.policy.interval(self.step);
        self.step = self.step.saturating_add(1);
        self.handed_out = self.handed_out.saturating_add(wait);
        Some(wait)
    }

    /// Number of waits handed out so far.
    pub fn attempts(&self) -> u32 {
        self.step
    }
}

/// Serde form of [`BackoffPolicy`] with millisecond fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: u64,
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(s: &BackoffSettings) -> Self {
        Self {
            initial_interval: Duration::from_millis(s.initial_interval_ms),
            multiplier: s.multiplier,
            max_interval: Duration::from_millis(s.max_interval_ms),
            max_elapsed_time: Duration::from_millis(s.max_elapsed_ms),
        }
    }
}

impl From<&BackoffPolicy> for BackoffSettings {
    fn from(p: &BackoffPolicy) -> Self {
        Self {
            initial_interval_ms: p.initial_interval.as_millis() as u64,
            multiplier: p.multiplier,
            max_interval_ms: p.max_interval.as_millis() as u64,
            max_elapsed_ms: p.max_elapsed_time.as_millis() as u64,
        }
    }
}
