//! Rate configuration and counter readings.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::BulwarkError;

/// The effective limit and window for one evaluation.
///
/// Both values are strictly positive; construction rejects zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RateConfig {
    limit: u64,
    window_secs: u32,
}

impl RateConfig {
    /// Create a rate configuration allowing `limit` requests every `window_secs` seconds.
    pub fn new(limit: u64, window_secs: u32) -> Result<Self, BulwarkError> {
        if limit == 0 {
            return Err(BulwarkError::Config("rate limit must be at least 1".to_string()));
        }
        if window_secs == 0 {
            return Err(BulwarkError::Config(
                "rate window must be at least 1 second".to_string(),
            ));
        }
        Ok(Self { limit, window_secs })
    }

    /// Maximum requests allowed in one window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u32 {
        self.window_secs
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_secs))
    }
}

impl<'de> Deserialize<'de> for RateConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            limit: u64,
            window_secs: u32,
        }

        let raw = Raw::deserialize(deserializer)?;
        RateConfig::new(raw.limit, raw.window_secs).map_err(serde::de::Error::custom)
    }
}

/// What the store reported after one increment.
///
/// `reset_at` is the moment the current window ends. It is fixed by the
/// increment that opened the window and echoed unchanged by every later
/// increment in that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Requests counted in the current window, this one included
    pub count: u64,
    /// When the current window expires
    pub reset_at: DateTime<Utc>,
}

impl CounterReading {
    pub fn new(count: u64, reset_at: DateTime<Utc>) -> Self {
        Self { count, reset_at }
    }

    /// Whether this increment opened a new window.
    pub fn opened_window(&self) -> bool {
        self.count == 1
    }
}
