//! Postgres connection pool, transactional helper, and the store seam.
//!
//! The [`Database`] trait is the transaction source shared by the Postgres
//! pool and the in-memory store: services and workers open transactions
//! through it without knowing which backend is underneath. All repository
//! mutations take the open [`StoreTx`]; reads go through the default
//! connection.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{info, warn};

use crate::repository::memory::MemTx;

const CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("transaction commit failed: {0}")]
    Commit(String),

    #[error("transaction opened against a different store backend")]
    BackendMismatch,
}

impl From<StoreError> for conveyor_core::ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation(_) => {
                conveyor_core::ServiceError::conflict("username already exists")
            }
            other => conveyor_core::ServiceError::unavailable(other.to_string()),
        }
    }
}

/// A transaction source. Implemented by [`PgDatabase`] and the in-memory
/// store; everything above the repositories depends on this seam.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<StoreTx, StoreError>;
}

/// An open store transaction.
///
/// Dropping a `StoreTx` without committing rolls it back; this is what makes
/// the [`with_transaction`] helper safe on early returns and panics.
pub struct StoreTx(pub(crate) TxInner);

pub(crate) enum TxInner {
    Pg(Transaction<'static, Postgres>),
    Mem(MemTx),
}

impl StoreTx {
    pub async fn commit(self) -> Result<(), StoreError> {
        match self.0 {
            TxInner::Pg(tx) => tx.commit().await.map_err(StoreError::from),
            TxInner::Mem(tx) => tx.commit(),
        }
    }
}

/// Run `f` inside a transaction: rolled back if `f` fails, committed if it
/// returns cleanly. The closure receives the open transaction and must hand
/// it back alongside its result.
pub async fn with_transaction<T, E, F, Fut>(db: &dyn Database, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce(StoreTx) -> Fut,
    Fut: Future<Output = Result<(StoreTx, T), E>>,
{
    let tx = db.begin().await.map_err(E::from)?;
    let (tx, value) = f(tx).await?;
    tx.commit().await.map_err(E::from)?;
    Ok(value)
}

/// Postgres-backed transaction source.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> Result<StoreTx, StoreError> {
        Ok(StoreTx(TxInner::Pg(self.pool.begin().await?)))
    }
}

/// Connect to Postgres with bounded retry (linear back-off).
///
/// Pool bounds: transactions are short-lived, so a deep pool with a modest
/// idle floor keeps worker claim/finalize latency flat under load.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(100)
            .min_connections(10)
            .max_lifetime(Duration::from_secs(30 * 60))
            .idle_timeout(Duration::from_secs(5 * 60))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("database connection established");
                return Ok(pool);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    max_attempts = CONNECT_ATTEMPTS,
                    error = %e,
                    "failed to connect to database, retrying"
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
