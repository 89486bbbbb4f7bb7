//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use super::key::StoreKey;
use super::types::{Identity, LimitKind, RateLimitConfig, RateLimitStatus};
use crate::config::LimitsConfig;
use crate::store::{CounterStore, StoreError};

/// Lifetime of a request counter, refreshed by every increment.
pub const COUNTER_WINDOW: Duration = Duration::from_secs(1);

/// A limit check that could not be completed, tagged with the failing step.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("failed to check block status")]
    BlockStatus(#[source] StoreError),

    #[error("failed to get block TTL")]
    BlockTtl(#[source] StoreError),

    #[error("failed to increment counter")]
    Increment(#[source] StoreError),

    /// The counter was already incremented when this happened.
    #[error("failed to set block")]
    SetBlock(#[source] StoreError),
}

impl LimiterError {
    /// The underlying store error.
    pub fn store_error(&self) -> &StoreError {
        match self {
            LimiterError::BlockStatus(e)
            | LimiterError::BlockTtl(e)
            | LimiterError::Increment(e)
            | LimiterError::SetBlock(e) => e,
        }
    }
}

/// Fixed-window limiter for IP addresses and API tokens.
///
/// Each identity gets a counter that lives for [`COUNTER_WINDOW`] after its
/// most recent request. The request that pushes the counter past the limit is
/// rejected and blocks the identity for the configured block duration.
///
/// Shared across tasks behind an `Arc`. Token overrides set with
/// [`set_token_limit`](Self::set_token_limit) are seen by every check that
/// starts afterwards; checks already running keep the limit they read.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    ip_limit: u64,
    default_token_limit: u64,
    block_duration: Duration,
    token_limits: DashMap<String, u64>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend())
            .field("ip_limit", &self.ip_limit)
            .field("default_token_limit", &self.default_token_limit)
            .field("block_duration", &self.block_duration)
            .field("token_overrides", &self.token_limits.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        ip_limit: u64,
        token_limit: u64,
        block_duration: Duration,
    ) -> Self {
        Self {
            store,
            ip_limit,
            default_token_limit: token_limit,
            block_duration,
            token_limits: DashMap::new(),
        }
    }

    /// Build a limiter from configuration, installing its token overrides.
    pub fn from_config(store: Arc<dyn CounterStore>, limits: &LimitsConfig) -> Self {
        let limiter = Self::new(
            store,
            limits.ip_limit,
            limits.token_limit,
            limits.block_duration(),
        );
        for (token, limit) in &limits.token_limits {
            limiter.set_token_limit(token.clone(), *limit);
        }
        limiter
    }

    /// Install or replace the limit for one token.
    pub fn set_token_limit(&self, token: impl Into<String>, limit: u64) {
        let token = token.into();
        debug!(limit, "Setting token limit override");
        self.token_limits.insert(token, limit);
    }

    /// The limit a check for `token` would use right now.
    pub fn token_limit(&self, token: &str) -> u64 {
        self.token_limits
            .get(token)
            .map(|limit| *limit)
            .unwrap_or(self.default_token_limit)
    }

    /// The store this limiter reads and writes.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub async fn check_ip(&self, ip: &str) -> Result<RateLimitStatus, LimiterError> {
        let config = RateLimitConfig {
            key: ip.to_string(),
            kind: LimitKind::Ip,
            max_requests: self.ip_limit,
            block_duration: self.block_duration,
        };
        self.check_limit(&config).await
    }

    pub async fn check_token(&self, token: &str) -> Result<RateLimitStatus, LimiterError> {
        let config = RateLimitConfig {
            key: token.to_string(),
            kind: LimitKind::Token,
            max_requests: self.token_limit(token),
            block_duration: self.block_duration,
        };
        self.check_limit(&config).await
    }

    /// Check whichever limit applies to `identity`.
    pub async fn check(&self, identity: &Identity) -> Result<RateLimitStatus, LimiterError> {
        match identity {
            Identity::Ip(ip) => self.check_ip(ip).await,
            Identity::Token(token) => self.check_token(token).await,
        }
    }

    /// Run the check-and-block algorithm for one request.
    ///
    /// Store failures abort the check. No retry is attempted and nothing is
    /// rolled back: if blocking fails after the increment, the count stays.
    pub async fn check_limit(
        &self,
        config: &RateLimitConfig,
    ) -> Result<RateLimitStatus, LimiterError> {
        let block_key = StoreKey::block(config.kind, &config.key).to_string();

        trace!(key = %block_key, limit = config.max_requests, "Checking rate limit");

        let blocked = self
            .store
            .is_blocked(&block_key)
            .await
            .map_err(LimiterError::BlockStatus)?;

        if blocked {
            let now = Utc::now();
            let ttl = self
                .store
                .get_ttl(&block_key)
                .await
                .map_err(LimiterError::BlockTtl)?;

            trace!(key = %block_key, ttl_ms = ttl.as_millis() as u64, "Identity is blocked");
            return Ok(RateLimitStatus::blocked(release_time(now, ttl)));
        }

        let count_key = StoreKey::counter(config.kind, &config.key).to_string();
        let count = self
            .store
            .increment(&count_key, COUNTER_WINDOW)
            .await
            .map_err(LimiterError::Increment)?;
        let count = u64::try_from(count).unwrap_or(0);

        if count > config.max_requests {
            self.store
                .set_block(&block_key, config.block_duration)
                .await
                .map_err(LimiterError::SetBlock)?;
            let now = Utc::now();

            debug!(
                key = %count_key,
                count,
                limit = config.max_requests,
                block_secs = config.block_duration.as_secs(),
                "Rate limit exceeded, blocking identity"
            );
            return Ok(RateLimitStatus::blocked(release_time(now, config.block_duration)));
        }

        Ok(RateLimitStatus::allowed(config.max_requests.saturating_sub(count)))
    }
}

/// Wall-clock time `duration` after `now`, rounded up to a whole second and
/// saturating at the maximum date.
///
/// Store TTLs come from a different clock than `now`; rounding absorbs the
/// skew so answers for one block never move later.
fn release_time(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .and_then(|at| {
            let secs = at.timestamp() + i64::from(at.timestamp_subsec_nanos() > 0);
            DateTime::from_timestamp(secs, 0)
        })
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
