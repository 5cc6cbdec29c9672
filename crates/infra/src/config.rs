//! Process configuration, loaded from the environment.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub worker_count: usize,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis stream key backing the task queue.
    pub stream: String,
    /// Consumer group shared by the worker pool.
    pub group: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                tracing::warn!("JWT_SECRET not set; using insecure dev default");
                "dev-secret".to_string()
            }
        };

        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let worker_count = match std::env::var("WORKER_COUNT") {
            Ok(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or(ConfigError::Invalid("WORKER_COUNT", raw))?,
            Err(_) => 3,
        };

        let queue = QueueConfig {
            stream: std::env::var("QUEUE_STREAM")
                .unwrap_or_else(|_| "conveyor:tasks".to_string()),
            group: std::env::var("QUEUE_GROUP").unwrap_or_else(|_| "task-workers".to_string()),
        };

        Ok(Self {
            bind_addr,
            database_url,
            redis_url,
            jwt_secret,
            worker_count,
            queue,
        })
    }
}
