//! Shared cache store used to persist the proxy inventory between processes
//!
//! The dispatcher only needs `get` and `set` with a time-to-live; anything
//! that can offer those (Redis, memcached, a local map) can back it.

mod memory;

pub use memory::MemoryCacheStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Key/value store with per-entry expiry
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the bytes stored under `key`, `None` on a miss
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Time left before `key` expires. `None` when unknown or missing.
    async fn remaining_ttl(&self, _key: &str) -> Result<Option<Duration>> {
        Ok(None)
    }
}
