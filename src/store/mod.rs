//! Counter stores.
//!
//! This module holds the implementations of
//! [`CounterBackend`](crate::ratelimit::CounterBackend): an in-process store
//! for single-instance deployments and tests, and a Redis store that is the
//! canonical counter source for every instance of a horizontally scaled
//! service.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use thiserror::Error;

/// Errors that can occur talking to a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to counter store: {0}")]
    Connection(String),
    #[error("Counter store command failed: {0}")]
    Command(String),
    #[error("Counter store returned an invalid reply: {0}")]
    InvalidReply(String),
}
