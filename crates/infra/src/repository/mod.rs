//! Repository contracts for tasks and users.
//!
//! Both services and the worker runtime depend on these narrow interfaces;
//! nothing above this layer sees SQL. Mutating calls take the open
//! [`StoreTx`](crate::db::StoreTx); reads use the default connection.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use conveyor_core::{Task, User};

use crate::db::{StoreError, StoreTx};

/// Outcome of a worker claim against a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The row moved to (or stayed in) PROCESSING.
    Claimed,
    /// The row is already SUCCESS or FAILED; the claim is a no-op and the
    /// delivery should simply be acknowledged.
    AlreadyTerminal,
    /// No row with this id exists (e.g. a message leaked by an aborted
    /// enqueue transaction).
    NotFound,
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new PENDING row, returning the generated id.
    async fn insert(
        &self,
        tx: &mut StoreTx,
        user_id: i64,
        task_type: &str,
    ) -> Result<i64, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>, StoreError>;

    async fn get_by_user(&self, user_id: i64) -> Result<Vec<Task>, StoreError>;

    /// Transition a row to PROCESSING. Idempotent: re-claiming a PROCESSING
    /// row succeeds, and a terminal row is reported rather than regressed.
    async fn mark_processing(&self, tx: &mut StoreTx, id: i64) -> Result<Claim, StoreError>;

    /// Transition a PROCESSING row to SUCCESS with its result reference.
    /// A no-op if the row is already terminal.
    async fn mark_success(
        &self,
        tx: &mut StoreTx,
        id: i64,
        result_file: &str,
    ) -> Result<(), StoreError>;

    /// Transition a PROCESSING row to FAILED with a user-facing message.
    /// A no-op if the row is already terminal.
    async fn mark_failed(
        &self,
        tx: &mut StoreTx,
        id: i64,
        error_message: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a new identity, returning the generated id. A duplicate
    /// username surfaces as [`StoreError::UniqueViolation`].
    async fn create(
        &self,
        tx: &mut StoreTx,
        username: &str,
        password_verifier: &str,
    ) -> Result<i64, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn update_verifier(
        &self,
        tx: &mut StoreTx,
        id: i64,
        password_verifier: &str,
    ) -> Result<(), StoreError>;
}
