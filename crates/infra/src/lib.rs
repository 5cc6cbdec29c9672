//! Infrastructure layer: configuration, Postgres store, Redis cache,
//! the Redis Streams work queue, and the token-bucket rate limiter.

pub mod cache;
pub mod config;
pub mod db;
pub mod queue;
pub mod rate_limit;
pub mod repository;

pub use config::Config;
pub use db::{with_transaction, Database, PgDatabase, StoreError, StoreTx};
