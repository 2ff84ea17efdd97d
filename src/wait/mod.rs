//! Backoff Poller - re-evaluates a predicate on a jittered retry schedule
//!
//! The schedule has two phases:
//! - an immediate phase of `IMMEDIATE_RETRIES` checks spaced `MIN_BACKOFF` apart
//! - a backoff phase where the interval doubles before every sleep, capped at `MAX_BACKOFF`
//!
//! Every interval is perturbed by ±`JITTER_RATIO` so independent pollers drift apart.

use rand::Rng;
use std::time::Duration;

pub const IMMEDIATE_RETRIES: u32 = 8;
pub const MIN_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF: Duration = Duration::from_millis(1600);
pub const JITTER_RATIO: f64 = 0.25;

/// A bounded wait ran out of budget before its condition held.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timeout expired")]
pub struct TimeoutExpired;

/// Un-jittered interval schedule used by [`Poller::wait`].
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempt: 0,
            current: MIN_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval to sleep before the next check, before jitter.
    pub fn next_interval(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt <= IMMEDIATE_RETRIES {
            return MIN_BACKOFF;
        }
        self.current = (self.current * 2).min(MAX_BACKOFF);
        self.current
    }
}

/// Spreads `base` uniformly over `[base - 25%, base + 25%]`.
pub fn jitter(base: Duration) -> Duration {
    let secs = base.as_secs_f64();
    let spread = secs * JITTER_RATIO;
    if spread <= 0.0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((secs + offset).max(0.0))
}

pub struct Poller;

impl Poller {
    /// Sleeps on the backoff schedule until `supplier` returns true.
    ///
    /// With `timeout = None` this polls forever. Otherwise every actual (jittered) sleep
    /// is charged against the budget and `TimeoutExpired` is returned as soon as the
    /// budget is spent, without checking the predicate one last time.
    pub async fn wait<F>(mut supplier: F, timeout: Option<Duration>) -> Result<(), TimeoutExpired>
    where
        F: FnMut() -> bool,
    {
        let mut remaining = timeout;
        let mut schedule = Backoff::new();

        while !supplier() {
            let delay = jitter(schedule.next_interval());
            tokio::time::sleep(delay).await;

            if let Some(budget) = remaining {
                match budget.checked_sub(delay) {
                    Some(left) if !left.is_zero() => remaining = Some(left),
                    _ => return Err(TimeoutExpired),
                }
            }
        }

        Ok(())
    }
}
