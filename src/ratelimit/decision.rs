//! Allow/deny decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::counter::{CounterReading, RateConfig};
use super::key::CounterKey;

/// The result of one limited request. Attached to the request whether it
/// was allowed or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateResult {
    /// Maximum requests per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset: DateTime<Utc>,
    /// Whether this request is admitted
    pub allowed: bool,
    /// Window length in seconds
    pub window_secs: u32,
}

impl RateResult {
    /// The over-limit condition, if this request was denied.
    pub fn exceeded(&self) -> Option<RateLimitExceeded> {
        if self.allowed {
            return None;
        }
        Some(RateLimitExceeded {
            limit: self.limit,
            remaining: 0,
            reset: self.reset,
            window_secs: self.window_secs,
        })
    }

    /// Seconds from `now` until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset - now).num_milliseconds();
        if millis <= 0 {
            return 0;
        }
        (millis as u64).div_ceil(1000)
    }
}

/// A request was over its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitExceeded {
    pub limit: u64,
    pub remaining: u64,
    pub reset: DateTime<Utc>,
    pub window_secs: u32,
}

/// Turns a counter reading into a decision. Pure and stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether the request that produced `reading` is admitted.
    pub fn decide(&self, key: &CounterKey, rate: &RateConfig, reading: &CounterReading) -> RateResult {
        let limit = rate.limit();
        let allowed = reading.count <= limit;

        if !allowed {
            debug!(
                key = %key,
                count = reading.count,
                limit = limit,
                reset = %reading.reset_at,
                "Rate limit exceeded"
            );
        }

        RateResult {
            limit,
            remaining: limit.saturating_sub(reading.count),
            reset: reading.reset_at,
            allowed,
            window_secs: rate.window_secs(),
        }
    }
}
