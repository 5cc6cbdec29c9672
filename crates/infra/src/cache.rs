//! Redis-backed read cache and connection bootstrap.
//!
//! One Redis instance hosts the read cache, the rate-limiter buckets, and
//! the task stream; [`connect`] is the shared entry point with bounded
//! retry, mirroring the store bootstrap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::{info, warn};

/// TTL for `task:<id>` and `tasks:user:<id>` entries.
pub const TASK_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Request-path deadline for cache reads; a timeout counts as a miss.
pub const CACHE_DEADLINE: Duration = Duration::from_secs(2);

const CONNECT_ATTEMPTS: u32 = 5;

pub fn task_key(task_id: i64) -> String {
    format!("task:{task_id}")
}

pub fn user_tasks_key(user_id: i64) -> String {
    format!("tasks:user:{user_id}")
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),
}

/// Connect to Redis with bounded retry, returning the client (for dedicated
/// consumer connections) and a multiplexed manager for request-path commands.
pub async fn connect(redis_url: &str) -> Result<(redis::Client, ConnectionManager), CacheError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| CacheError::Connection(e.to_string()))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.get_tokio_connection_manager().await {
            Ok(mut manager) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut manager).await;
                match pong {
                    Ok(_) => {
                        info!("redis connection established");
                        return Ok((client, manager));
                    }
                    Err(e) if attempt < CONNECT_ATTEMPTS => {
                        warn!(attempt, error = %e, "redis ping failed, retrying");
                    }
                    Err(e) => return Err(CacheError::Connection(e.to_string())),
                }
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %e, "failed to connect to redis, retrying");
            }
            Err(e) => return Err(CacheError::Connection(e.to_string())),
        }
        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
    }
}

/// Byte-oriented cache interface used by the read path.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("GET failed: {e}")))
    }

    async fn set_bytes(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("SET failed: {e}")))
    }
}

/// In-memory cache honoring TTLs, for tests and local development.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, (Vec<u8>, Instant)>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .map(|(_, expires)| *expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).and_then(|(value, expires)| {
            (*expires > Instant::now()).then(|| value.clone())
        }))
    }

    async fn set_bytes(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }
}
