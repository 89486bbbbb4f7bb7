//! In-process counter store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{CounterStore, StoreError};

/// Default interval between expiry sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Value written for a block flag.
const BLOCK_FLAG: i64 = 1;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

type Table = RwLock<HashMap<String, Entry>>;

/// Counter store backed by a single lock-protected table.
///
/// Expired entries are hidden from reads immediately and physically removed
/// by a background sweep. The sweep stops on [`close`](CounterStore::close)
/// or when the store is dropped.
pub struct MemoryStore {
    table: Arc<Table>,
    sweep: CancellationToken,
}

impl MemoryStore {
    /// Create a store sweeping once per second.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a store with a custom sweep interval.
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let table = Arc::new(RwLock::new(HashMap::new()));
        let sweep = CancellationToken::new();

        tokio::spawn(run_sweep_loop(
            Arc::downgrade(&table),
            sweep_interval,
            sweep.clone(),
        ));

        Self { table, sweep }
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge_expired(&self.table)
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn entry_count(&self) -> usize {
        self.table.read().len()
    }

    /// Look up an unexpired entry.
    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        self.table
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .copied()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.sweep.cancel();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut table = self.table.write();

        let entry = table
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.is_expired(now) {
                    entry.value = 0;
                }
            })
            .or_insert(Entry {
                value: 0,
                expires_at: now,
            });

        // The expiration moves on every increment, not only on creation.
        entry.value += 1;
        entry.expires_at = now + ttl;

        trace!(key = %key, count = entry.value, "Incremented counter");
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.live_entry(key).map(|entry| entry.value).unwrap_or(0))
    }

    async fn set_block(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + duration;
        self.table.write().insert(
            key.to_string(),
            Entry {
                value: BLOCK_FLAG,
                expires_at,
            },
        );
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .live_entry(key)
            .map(|entry| entry.value == BLOCK_FLAG)
            .unwrap_or(false))
    }

    async fn get_ttl(&self, key: &str) -> Result<Duration, StoreError> {
        Ok(self
            .live_entry(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.sweep.cancel();
        self.table.write().clear();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

fn purge_expired(table: &Table) -> usize {
    let now = Instant::now();
    let mut table = table.write();
    let before = table.len();
    table.retain(|_, entry| !entry.is_expired(now));
    before - table.len()
}

async fn run_sweep_loop(table: Weak<Table>, sweep_interval: Duration, cancel: CancellationToken) {
    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_ms = sweep_interval.as_millis() as u64, "Expiry sweep started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(live) = table.upgrade() else { break };
                let removed = purge_expired(&live);
                if removed > 0 {
                    debug!(removed, "Swept expired entries");
                }
            }
        }
    }

    info!("Expiry sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    /// A sweep interval long enough that only passive expiry is observable.
    const NO_SWEEP: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_increment() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("test:key", Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(store.increment("test:key", Duration::from_secs(5)).await.unwrap(), 2);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get() {
        let store = MemoryStore::new();

        assert_eq!(store.get("test:key").await.unwrap(), 0);

        store.increment("test:key", Duration::from_secs(5)).await.unwrap();
        store.increment("test:key", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("test:key").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_does_not_refresh_expiration() {
        let store = MemoryStore::with_sweep_interval(NO_SWEEP);

        store.increment("test:key", Duration::from_millis(200)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("test:key").await.unwrap(), 1);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("test:key").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_block_and_expiry() {
        let store = MemoryStore::new();

        assert!(!store.is_blocked("block:test").await.unwrap());

        store.set_block("block:test", Duration::from_millis(100)).await.unwrap();
        assert!(store.is_blocked("block:test").await.unwrap());

        sleep(Duration::from_millis(150)).await;
        assert!(!store.is_blocked("block:test").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_block_overwrites_counter() {
        let store = MemoryStore::new();

        for _ in 0..3 {
            store.increment("shared", Duration::from_secs(5)).await.unwrap();
        }
        assert!(!store.is_blocked("shared").await.unwrap());

        store.set_block("shared", Duration::from_secs(5)).await.unwrap();
        assert!(store.is_blocked("shared").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_ttl() {
        let store = MemoryStore::new();

        assert_eq!(store.get_ttl("test:ttl").await.unwrap(), Duration::ZERO);

        store.set_block("test:ttl", Duration::from_secs(5)).await.unwrap();
        let ttl = store.get_ttl("test:ttl").await.unwrap();
        assert!(ttl > Duration::from_secs(4));
        assert!(ttl <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_expired_counter_restarts_at_one() {
        let store = MemoryStore::with_sweep_interval(NO_SWEEP);

        store.increment("test:expire", Duration::from_millis(50)).await.unwrap();
        store.increment("test:expire", Duration::from_millis(50)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(store.get("test:expire").await.unwrap(), 0);
        assert_eq!(store.get_ttl("test:expire").await.unwrap(), Duration::ZERO);
        assert_eq!(store.increment("test:expire", Duration::from_millis(50)).await.unwrap(), 1);
    }

    /// The counter's expiration is pushed forward by every increment, so a
    /// steady stream of requests never resets it; only an idle gap does.
    #[tokio::test]
    async fn test_increment_refreshes_expiration() {
        let store = MemoryStore::with_sweep_interval(NO_SWEEP);
        let ttl = Duration::from_millis(200);

        for expected in 1..=5 {
            assert_eq!(store.increment("test:stream", ttl).await.unwrap(), expected);
            sleep(Duration::from_millis(100)).await;
        }
        // 500ms after the first increment, well past one ttl, still counting.
        assert_eq!(store.get("test:stream").await.unwrap(), 5);

        sleep(Duration::from_millis(250)).await;
        assert_eq!(store.increment("test:stream", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_passive_expiry_keeps_entry_until_swept() {
        let store = MemoryStore::with_sweep_interval(NO_SWEEP);

        store.increment("test:lazy", Duration::from_millis(20)).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get("test:lazy").await.unwrap(), 0);
        assert_eq!(store.entry_count(), 1);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let store = MemoryStore::with_sweep_interval(Duration::from_millis(25));

        store.increment("test:a", Duration::from_millis(10)).await.unwrap();
        store.set_block("test:b", Duration::from_millis(10)).await.unwrap();
        store.increment("test:c", Duration::from_secs(60)).await.unwrap();

        sleep(Duration::from_millis(150)).await;
        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.get("test:c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_clears_and_stops_sweep() {
        let store = MemoryStore::new();

        store.increment("test:key", Duration::from_secs(5)).await.unwrap();
        store.set_block("block:test", Duration::from_secs(5)).await.unwrap();

        store.close().await.unwrap();
        assert!(store.sweep.is_cancelled());
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.get("test:key").await.unwrap(), 0);
        assert!(!store.is_blocked("block:test").await.unwrap());

        // Idempotent
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_construct_and_close() {
        for _ in 0..100 {
            let store = MemoryStore::with_sweep_interval(Duration::from_millis(1));
            store.increment("test:key", Duration::from_secs(1)).await.unwrap();
            store.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drop_cancels_sweep() {
        let store = MemoryStore::new();
        let token = store.sweep.clone();

        drop(store);
        assert!(token.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment("test:hot", Duration::from_secs(5)).await.unwrap()
                })
            })
            .collect();

        let mut seen: Vec<i64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
        assert_eq!(store.get("test:hot").await.unwrap(), 200);
    }
}
