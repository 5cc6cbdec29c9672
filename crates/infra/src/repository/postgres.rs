//! Postgres repositories.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use conveyor_core::{Task, TaskStatus, User};

use crate::db::{StoreError, StoreTx, TxInner};

use super::{Claim, TaskRepository, UserRepository};

const PG_UNIQUE_VIOLATION: &str = "23505";

pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_task(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(StoreError::Corrupt)?;

    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        task_type: row.try_get("task_type")?,
        status,
        result_file: row.try_get("result_file")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn insert(
        &self,
        tx: &mut StoreTx,
        user_id: i64,
        task_type: &str,
    ) -> Result<i64, StoreError> {
        let TxInner::Pg(pg) = &mut tx.0 else {
            return Err(StoreError::BackendMismatch);
        };

        let row = sqlx::query(
            r#"
            INSERT INTO tasks (user_id, task_type, status, created_at, updated_at)
            VALUES ($1, $2, 'PENDING', NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(task_type)
        .fetch_one(&mut **pg)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, task_type, status,
                   result_file, error_message,
                   created_at, updated_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_by_user(&self, user_id: i64) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, task_type, status,
                   result_file, error_message,
                   created_at, updated_at
            FROM tasks
            WHERE user_id = $1
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn mark_processing(&self, tx: &mut StoreTx, id: i64) -> Result<Claim, StoreError> {
        let TxInner::Pg(pg) = &mut tx.0 else {
            return Err(StoreError::BackendMismatch);
        };

        // Terminal rows are excluded from the predicate so a duplicate
        // delivery can never regress SUCCESS or FAILED.
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(id)
        .execute(&mut **pg)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(Claim::Claimed);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **pg)
            .await?;

        match status {
            None => Ok(Claim::NotFound),
            Some(_) => Ok(Claim::AlreadyTerminal),
        }
    }

    async fn mark_success(
        &self,
        tx: &mut StoreTx,
        id: i64,
        result_file: &str,
    ) -> Result<(), StoreError> {
        let TxInner::Pg(pg) = &mut tx.0 else {
            return Err(StoreError::BackendMismatch);
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'SUCCESS',
                result_file = $1,
                updated_at = NOW()
            WHERE id = $2 AND status NOT IN ('SUCCESS', 'FAILED')
            "#,
        )
        .bind(result_file)
        .bind(id)
        .execute(&mut **pg)
        .await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        tx: &mut StoreTx,
        id: i64,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let TxInner::Pg(pg) = &mut tx.0 else {
            return Err(StoreError::BackendMismatch);
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED',
                error_message = $1,
                updated_at = NOW()
            WHERE id = $2 AND status NOT IN ('SUCCESS', 'FAILED')
            "#,
        )
        .bind(error_message)
        .bind(id)
        .execute(&mut **pg)
        .await?;

        Ok(())
    }
}

pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_verifier: row.try_get("password_verifier")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(
        &self,
        tx: &mut StoreTx,
        username: &str,
        password_verifier: &str,
    ) -> Result<i64, StoreError> {
        let TxInner::Pg(pg) = &mut tx.0 else {
            return Err(StoreError::BackendMismatch);
        };

        let row = sqlx::query(
            r#"
            INSERT INTO users (username, password_verifier, created_at)
            VALUES ($1, $2, NOW())
            RETURNING id
            "#,
        )
        .bind(username)
        .bind(password_verifier)
        .fetch_one(&mut **pg)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) => {
                StoreError::UniqueViolation("username".to_string())
            }
            _ => StoreError::Database(e),
        })?;

        Ok(row.try_get("id")?)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, password_verifier, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, password_verifier, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn update_verifier(
        &self,
        tx: &mut StoreTx,
        id: i64,
        password_verifier: &str,
    ) -> Result<(), StoreError> {
        let TxInner::Pg(pg) = &mut tx.0 else {
            return Err(StoreError::BackendMismatch);
        };

        sqlx::query("UPDATE users SET password_verifier = $1 WHERE id = $2")
            .bind(password_verifier)
            .bind(id)
            .execute(&mut **pg)
            .await?;

        Ok(())
    }
}
