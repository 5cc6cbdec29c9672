//! In-memory store with the same transactional contract as Postgres.
//!
//! Used by tests and local development wiring. Writes are staged on the
//! transaction and applied on commit, so a dropped transaction rolls back
//! exactly like the real store. Commit failures can be injected to exercise
//! the worker retry path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conveyor_core::{Task, TaskStatus, User};

use crate::db::{Database, StoreError, StoreTx, TxInner};

use super::{Claim, TaskRepository, UserRepository};

#[derive(Default)]
struct MemState {
    tasks: HashMap<i64, Task>,
    users: HashMap<i64, User>,
    next_task_id: i64,
    next_user_id: i64,
    skip_commits: u32,
    failing_commits: u32,
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_repository(&self) -> InMemoryTaskRepository {
        InMemoryTaskRepository {
            state: self.state.clone(),
        }
    }

    pub fn user_repository(&self) -> InMemoryUserRepository {
        InMemoryUserRepository {
            state: self.state.clone(),
        }
    }

    /// Arrange for commits to fail: the next `skip` commits succeed, the
    /// `fail` after those return an error and discard their writes.
    pub fn fail_commits(&self, skip: u32, fail: u32) {
        let mut state = self.state.lock().unwrap();
        state.skip_commits = skip;
        state.failing_commits = fail;
    }
}

#[async_trait]
impl Database for InMemoryStore {
    async fn begin(&self) -> Result<StoreTx, StoreError> {
        Ok(StoreTx(TxInner::Mem(MemTx {
            state: self.state.clone(),
            ops: Vec::new(),
        })))
    }
}

/// Staged writes for one in-memory transaction.
pub struct MemTx {
    state: Arc<Mutex<MemState>>,
    ops: Vec<MemOp>,
}

enum MemOp {
    InsertTask(Task),
    MarkProcessing(i64),
    MarkSuccess(i64, String),
    MarkFailed(i64, String),
    InsertUser(User),
    UpdateVerifier(i64, String),
}

impl MemTx {
    pub(crate) fn commit(mut self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        if state.skip_commits > 0 {
            state.skip_commits -= 1;
        } else if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Commit("injected commit failure".to_string()));
        }

        let now = Utc::now();
        for op in self.ops.drain(..) {
            apply(&mut state, op, now);
        }
        Ok(())
    }
}

fn apply(state: &mut MemState, op: MemOp, now: DateTime<Utc>) {
    match op {
        MemOp::InsertTask(task) => {
            state.tasks.insert(task.id, task);
        }
        MemOp::MarkProcessing(id) => {
            if let Some(task) = state.tasks.get_mut(&id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Processing;
                    task.updated_at = now;
                }
            }
        }
        MemOp::MarkSuccess(id, result_file) => {
            if let Some(task) = state.tasks.get_mut(&id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Success;
                    task.result_file = Some(result_file);
                    task.updated_at = now;
                }
            }
        }
        MemOp::MarkFailed(id, error_message) => {
            if let Some(task) = state.tasks.get_mut(&id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Failed;
                    task.error_message = Some(error_message);
                    task.updated_at = now;
                }
            }
        }
        MemOp::InsertUser(user) => {
            state.users.insert(user.id, user);
        }
        MemOp::UpdateVerifier(id, verifier) => {
            if let Some(user) = state.users.get_mut(&id) {
                user.password_verifier = verifier;
            }
        }
    }
}

fn staged<'a>(tx: &'a mut StoreTx) -> Result<&'a mut MemTx, StoreError> {
    match &mut tx.0 {
        TxInner::Mem(mem) => Ok(mem),
        TxInner::Pg(_) => Err(StoreError::BackendMismatch),
    }
}

#[derive(Clone)]
pub struct InMemoryTaskRepository {
    state: Arc<Mutex<MemState>>,
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(
        &self,
        tx: &mut StoreTx,
        user_id: i64,
        task_type: &str,
    ) -> Result<i64, StoreError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_task_id += 1;
            state.next_task_id
        };

        let now = Utc::now();
        staged(tx)?.ops.push(MemOp::InsertTask(Task {
            id,
            user_id,
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            result_file: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }));

        Ok(id)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn get_by_user(&self, user_id: i64) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn mark_processing(&self, tx: &mut StoreTx, id: i64) -> Result<Claim, StoreError> {
        let claim = {
            let state = self.state.lock().unwrap();
            match state.tasks.get(&id) {
                None => Claim::NotFound,
                Some(task) if task.status.is_terminal() => Claim::AlreadyTerminal,
                Some(_) => Claim::Claimed,
            }
        };

        if claim == Claim::Claimed {
            staged(tx)?.ops.push(MemOp::MarkProcessing(id));
        }
        Ok(claim)
    }

    async fn mark_success(
        &self,
        tx: &mut StoreTx,
        id: i64,
        result_file: &str,
    ) -> Result<(), StoreError> {
        staged(tx)?
            .ops
            .push(MemOp::MarkSuccess(id, result_file.to_string()));
        Ok(())
    }

    async fn mark_failed(
        &self,
        tx: &mut StoreTx,
        id: i64,
        error_message: &str,
    ) -> Result<(), StoreError> {
        staged(tx)?
            .ops
            .push(MemOp::MarkFailed(id, error_message.to_string()));
        Ok(())
    }
}

pub struct InMemoryUserRepository {
    state: Arc<Mutex<MemState>>,
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(
        &self,
        tx: &mut StoreTx,
        username: &str,
        password_verifier: &str,
    ) -> Result<i64, StoreError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.users.values().any(|u| u.username == username) {
                return Err(StoreError::UniqueViolation("username".to_string()));
            }
            state.next_user_id += 1;
            state.next_user_id
        };

        staged(tx)?.ops.push(MemOp::InsertUser(User {
            id,
            username: username.to_string(),
            password_verifier: password_verifier.to_string(),
            created_at: Utc::now(),
        }));

        Ok(id)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().unwrap().users.get(&id).cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn update_verifier(
        &self,
        tx: &mut StoreTx,
        id: i64,
        password_verifier: &str,
    ) -> Result<(), StoreError> {
        staged(tx)?
            .ops
            .push(MemOp::UpdateVerifier(id, password_verifier.to_string()));
        Ok(())
    }
}
