//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::StoreError;
use crate::ratelimit::{Clock, CounterBackend, CounterKey, CounterReading, SystemClock};

/// One window's worth of counting for one key.
#[derive(Debug, Clone, Copy)]
struct CounterRecord {
    count: u64,
    reset_at: DateTime<Utc>,
}

impl CounterRecord {
    fn open(now: DateTime<Utc>, window_secs: u32) -> Self {
        Self {
            count: 1,
            reset_at: now + TimeDelta::seconds(i64::from(window_secs)),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.reset_at > now
    }

    fn reading(&self) -> CounterReading {
        CounterReading::new(self.count, self.reset_at)
    }
}

/// A counter store living in this process.
///
/// The check, create and increment for a key all run while holding the
/// key's shard lock, so concurrent callers in this process observe a single
/// window per key. Counts are not shared with other processes; deployments
/// with more than one instance need [`RedisStore`](super::RedisStore).
pub struct MemoryStore {
    records: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    fn increment_key(&self, key: String, window_secs: u32) -> CounterReading {
        let now = self.clock.now();

        match self.records.entry(key) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let opened = if record.is_live(now) {
                    record.count += 1;
                    false
                } else {
                    // Expired: the old window is gone entirely, nothing carries over
                    *record = CounterRecord::open(now, window_secs);
                    true
                };

                let reading = occupied.get().reading();
                if opened {
                    debug!(key = %occupied.key(), reset_at = %reading.reset_at, "Opened new window");
                }
                reading
            }
            Entry::Vacant(vacant) => {
                let record = CounterRecord::open(now, window_secs);
                debug!(key = %vacant.key(), reset_at = %record.reset_at, "Opened new window");
                vacant.insert(record);
                record.reading()
            }
        }
    }

    /// The live reading for a key, without counting.
    pub fn peek(&self, key: &CounterKey) -> Option<CounterReading> {
        let now = self.clock.now();
        self.records
            .get(&key.to_store_key())
            .filter(|record| record.is_live(now))
            .map(|record| record.reading())
    }

    /// Number of records held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record whose window has ended. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        let purged = before.saturating_sub(self.records.len());

        if purged > 0 {
            trace!(purged = purged, "Purged expired counters");
        }
        purged
    }

    /// Purge expired records every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.purge_expired();
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterBackend for MemoryStore {
    async fn increment(&self, key: &CounterKey, window_secs: u32) -> Result<CounterReading, StoreError> {
        Ok(self.increment_key(key.to_store_key(), window_secs))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
