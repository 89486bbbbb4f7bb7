//! Counter stores backing the rate limiter.
//!
//! The limiter only ever talks to a [`CounterStore`]. Two implementations
//! exist: [`MemoryStore`] keeps state in this process, [`RedisStore`] shares it
//! between processes through Redis.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StorageConfig, StoreBackend};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors surfaced by counter stores.
///
/// A zero count or "not blocked" is only meaningful alongside `Ok`; callers
/// must never substitute defaults for an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within its deadline
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store was explicitly closed
    #[error("store is closed")]
    Closed,

    /// The store could not be constructed
    #[error("failed to connect to store: {0}")]
    Connect(String),

    /// Error reported by the Redis client
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Whether the error means the medium is unreachable (including timeouts).
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Connect(_) => true,
            StoreError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            StoreError::Closed => false,
        }
    }
}

/// Key-value counter and flag store with per-key expiration.
///
/// Implementations must be safe to share across tasks; `increment` must not
/// lose updates when called concurrently on the same key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Create the counter at 1 if absent or expired, otherwise add 1.
    /// In both cases the key expires `ttl` from now.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Current value, or 0 when absent or expired. Never touches expiration.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;

    /// Mark `key` as blocked for `duration`, replacing whatever was there.
    async fn set_block(&self, key: &str, duration: Duration) -> Result<(), StoreError>;

    /// True iff `key` holds an unexpired block flag.
    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError>;

    /// Time left before `key` expires; zero when absent, expired or persistent.
    async fn get_ttl(&self, key: &str) -> Result<Duration, StoreError>;

    /// Release resources. Calling it more than once is harmless.
    async fn close(&self) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Open the configured counter store.
///
/// A Redis backend that fails its initial connection check is replaced by an
/// in-process store; the failure is logged, not returned. Must be called from
/// within a Tokio runtime.
pub async fn open_store(config: &StorageConfig) -> Arc<dyn CounterStore> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-process counter store");
            Arc::new(MemoryStore::with_sweep_interval(config.sweep_interval()))
        }
        StoreBackend::Redis => match RedisStore::connect(&config.redis).await {
            Ok(store) => {
                info!("Using redis counter store");
                Arc::new(store)
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to redis, using in-process counter store");
                Arc::new(MemoryStore::with_sweep_interval(config.sweep_interval()))
            }
        },
    }
}
