//! Redis-backed counter store shared between processes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{CounterStore, StoreError};
use crate::config::RedisSettings;

/// Value written for a block flag.
const BLOCK_FLAG: &str = "1";

/// Counter store over a Redis connection manager.
///
/// Every command is bounded by the configured command timeout, so an
/// unresponsive server surfaces as [`StoreError::Timeout`] instead of a hang.
/// Closing drops the manager; its socket and reconnect task go away once
/// commands already in flight finish.
pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RedisStore {
    /// Connect and verify the server answers a PING within the connect timeout.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let info = settings.connection_info().map_err(|e| {
            warn!("Invalid Redis connection settings: {}", e);
            StoreError::Connect(e.to_string())
        })?;
        let client = redis::Client::open(info).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            StoreError::Connect(e.to_string())
        })?;

        let connect_timeout = settings.connect_timeout();
        let handshake = async {
            let mut connection = ConnectionManager::new(client).await?;
            redis::cmd("PING").query_async::<String>(&mut connection).await?;
            Ok::<_, redis::RedisError>(connection)
        };

        let connection = match timeout(connect_timeout, handshake).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!("Failed to ping Redis: {}", e);
                return Err(StoreError::Connect(e.to_string()));
            }
            Err(_) => {
                warn!(timeout_ms = connect_timeout.as_millis() as u64, "Redis did not answer in time");
                return Err(StoreError::Connect(format!(
                    "no answer within {:?}",
                    connect_timeout
                )));
            }
        };

        info!(
            command_timeout_ms = settings.command_timeout_ms,
            "Connected to Redis"
        );

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            command_timeout: settings.command_timeout(),
        })
    }

    /// Whether [`close`](CounterStore::close) has released the connection.
    pub fn is_closed(&self) -> bool {
        self.connection.read().is_none()
    }

    /// A handle on the shared connection, or [`StoreError::Closed`].
    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection.read().clone().ok_or(StoreError::Closed)
    }

    /// Run one round trip under the command timeout.
    async fn run<T, F>(&self, op: &'static str, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(|e| {
                debug!(op, error = %e, "Redis command failed");
                StoreError::from(e)
            }),
            Err(_) => {
                debug!(op, "Redis command timed out");
                Err(StoreError::Timeout(self.command_timeout))
            }
        }
    }
}

/// Milliseconds for a PX/PEXPIRE argument; Redis rejects zero.
fn expire_millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let (count,): (i64,) = self
            .run("increment", async move {
                redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(key)
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(expire_millis(ttl))
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        trace!(key = %key, count, "Incremented counter");
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let value: Option<i64> = self
            .run("get", async move {
                redis::cmd("GET").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_block(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;

        if duration.is_zero() {
            // A zero-length block is already over.
            return self
                .run("set_block", async move {
                    redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await
                })
                .await
                .map(|_| ());
        }

        self.run("set_block", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(BLOCK_FLAG)
                .arg("PX")
                .arg(expire_millis(duration))
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let value: Option<String> = self
            .run("is_blocked", async move {
                redis::cmd("GET").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(value.as_deref() == Some(BLOCK_FLAG))
    }

    async fn get_ttl(&self, key: &str) -> Result<Duration, StoreError> {
        let mut conn = self.connection()?;
        let millis: i64 = self
            .run("get_ttl", async move {
                redis::cmd("PTTL").arg(key).query_async(&mut conn).await
            })
            .await?;

        // -2: no such key, -1: no expiration
        Ok(if millis > 0 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::ZERO
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.connection.write().take().is_some() {
            info!("Redis counter store closed");
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
