//! Counter backend trait for abstracting in-process and shared stores.

use async_trait::async_trait;

use super::counter::CounterReading;
use super::key::CounterKey;
use crate::store::StoreError;

/// A store able to perform the fixed-window increment atomically.
///
/// Implementations must run the whole protocol as one indivisible operation:
///
/// - no live record for `key`: create it with count 1, a lifetime of
///   `window_secs`, and `reset_at = now + window_secs`;
/// - live record: add 1 and leave the lifetime and `reset_at` untouched;
/// - expired record: treated exactly like a missing one.
///
/// Records are removed only by store-side expiry.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Count one occurrence for `key` and report the window it landed in.
    async fn increment(&self, key: &CounterKey, window_secs: u32)
        -> Result<CounterReading, StoreError>;

    /// Short name used in logs.
    fn backend_name(&self) -> &'static str;
}
