//! Per-identity token-bucket rate limiting.
//!
//! The whole read-modify-write runs as a server-side Lua script, so
//! concurrent gateway instances contend correctly without client-side locks.
//! The limiter keys on the identity id only; client addresses are a concern
//! of the network tier.

use std::sync::Arc;

use chrono::Utc;
use redis::aio::ConnectionManager;

use crate::cache::CacheError;

const TOKEN_BUCKET_SCRIPT: &str = include_str!("token_bucket.lua");

pub fn user_rate_key(user_id: i64) -> String {
    format!("rate_limiter:user:{user_id}")
}

/// Bucket parameters: capacity is the burst ceiling, refill_rate the
/// sustained tokens-per-second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub refill_rate: f64,
}

impl RateLimiterConfig {
    /// Sensitive endpoints: 3 burst, one token per 10 seconds.
    pub fn strict() -> Self {
        Self {
            capacity: 3,
            refill_rate: 0.1,
        }
    }

    /// Write endpoints: 10 burst, 5/s sustained.
    pub fn conservative() -> Self {
        Self {
            capacity: 10,
            refill_rate: 5.0,
        }
    }

    /// Default: 20 burst, 10/s sustained.
    pub fn moderate() -> Self {
        Self {
            capacity: 20,
            refill_rate: 10.0,
        }
    }

    /// Read-heavy endpoints: 100 burst, 50/s sustained.
    pub fn generous() -> Self {
        Self {
            capacity: 100,
            refill_rate: 50.0,
        }
    }

    pub fn custom(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Bucket TTL: the time a full refill takes, rounded up.
    pub fn ttl_secs(&self) -> u64 {
        (self.capacity as f64 / self.refill_rate).ceil() as u64
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::moderate()
    }
}

/// Atomic token-bucket evaluator against Redis.
#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Arc::new(redis::Script::new(TOKEN_BUCKET_SCRIPT)),
        }
    }

    /// Evaluate one request attempt for an identity. `Ok(false)` means the
    /// bucket is empty; an `Err` means Redis itself was unreachable and the
    /// caller decides the failure policy (the gateway fails open).
    pub async fn check(
        &self,
        user_id: i64,
        config: &RateLimiterConfig,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .script
            .key(user_rate_key(user_id))
            .arg(config.capacity)
            .arg(config.refill_rate)
            .arg(Utc::now().timestamp())
            .arg(config.ttl_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("rate limiter script failed: {e}")))?;

        Ok(allowed == 1)
    }
}
