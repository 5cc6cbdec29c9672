//! Task service: the enqueue path and the cache-through read path.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use conveyor_core::{task, ServiceError, ServiceResult, Task, TaskMessage};
use conveyor_infra::cache::{self, CacheStore, CACHE_DEADLINE, TASK_CACHE_TTL};
use conveyor_infra::queue::QueuePublisher;
use conveyor_infra::repository::TaskRepository;
use conveyor_infra::{with_transaction, Database};

pub struct TaskService {
    db: Arc<dyn Database>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<dyn QueuePublisher>,
    cache: Arc<dyn CacheStore>,
}

impl TaskService {
    pub fn new(
        db: Arc<dyn Database>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<dyn QueuePublisher>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            db,
            tasks,
            queue,
            cache,
        }
    }

    /// Create a PENDING task and enqueue its work message.
    ///
    /// The publish happens inside the insert transaction, before commit: a
    /// broker failure aborts the insert, so a visible PENDING row always has
    /// a message behind it. The reverse window (message published, commit
    /// lost) leaks a message for a row that never existed; workers drop
    /// those on claim.
    pub async fn create_task(&self, owner_id: i64, task_type: &str) -> ServiceResult<i64> {
        if owner_id <= 0 {
            return Err(ServiceError::validation("owner id is required"));
        }
        task::validate_task_type(task_type)?;

        let task_id = with_transaction(&*self.db, |mut tx| async {
            let id = self.tasks.insert(&mut tx, owner_id, task_type).await?;
            let message = TaskMessage {
                id,
                user_id: owner_id,
                task_type: task_type.to_string(),
            };
            self.queue.publish(&message, 0).await?;
            Ok::<_, ServiceError>((tx, id))
        })
        .await?;

        info!(task_id, user_id = owner_id, task_type, "task enqueued");
        Ok(task_id)
    }

    /// Fetch a task, consulting the cache first. Ownership is checked by the
    /// gateway after the load.
    pub async fn get_task(&self, task_id: i64) -> ServiceResult<Task> {
        let key = cache::task_key(task_id);
        if let Some(task) = self.cache_get::<Task>(&key).await {
            debug!(task_id, "cache hit for task");
            return Ok(task);
        }
        debug!(task_id, "cache miss for task");

        let task = self
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or(ServiceError::NotFound("task"))?;

        self.cache_put(&key, &task).await;
        Ok(task)
    }

    /// List an identity's tasks, consulting the cache first. An empty list
    /// is a valid, cacheable result.
    pub async fn list_tasks(&self, owner_id: i64) -> ServiceResult<Vec<Task>> {
        let key = cache::user_tasks_key(owner_id);
        if let Some(tasks) = self.cache_get::<Vec<Task>>(&key).await {
            debug!(user_id = owner_id, "cache hit for user tasks");
            return Ok(tasks);
        }
        debug!(user_id = owner_id, "cache miss for user tasks");

        let tasks = self.tasks.get_by_user(owner_id).await?;
        self.cache_put(&key, &tasks).await;
        Ok(tasks)
    }

    /// Bounded cache read; timeouts and errors count as misses.
    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match tokio::time::timeout(CACHE_DEADLINE, self.cache.get_bytes(key)).await {
            Ok(Ok(Some(bytes))) => serde_json::from_slice(&bytes).ok(),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(key, error = %e, "cache read failed");
                None
            }
            Err(_) => {
                warn!(key, "cache read timed out");
                None
            }
        }
    }

    /// Best-effort cache population; failures are logged, never surfaced.
    async fn cache_put<T: Serialize>(&self, key: &str, value: &T) {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        match tokio::time::timeout(
            CACHE_DEADLINE,
            self.cache.set_bytes(key, &bytes, TASK_CACHE_TTL),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key, error = %e, "failed to populate cache"),
            Err(_) => warn!(key, "cache write timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::TaskStatus;
    use conveyor_infra::cache::InMemoryCache;
    use conveyor_infra::queue::memory::InMemoryQueue;
    use conveyor_infra::repository::memory::InMemoryStore;

    struct Fixture {
        service: TaskService,
        store: InMemoryStore,
        queue: InMemoryQueue,
        cache: InMemoryCache,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new();
        let cache = InMemoryCache::new();

        let service = TaskService::new(
            Arc::new(store.clone()),
            Arc::new(store.task_repository()),
            Arc::new(queue.clone()),
            Arc::new(cache.clone()),
        );

        Fixture {
            service,
            store,
            queue,
            cache,
        }
    }

    #[tokio::test]
    async fn create_task_persists_row_and_enqueues_message() {
        let fx = fixture();

        let id = fx.service.create_task(1, "send_email").await.unwrap();

        let task = fx
            .store
            .task_repository()
            .get_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.user_id, 1);
        assert_eq!(fx.queue.ready_len(), 1);
    }

    #[tokio::test]
    async fn create_task_validates_input() {
        let fx = fixture();

        assert!(matches!(
            fx.service.create_task(1, "").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            fx.service.create_task(0, "send_email").await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(fx.queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_the_insert() {
        let fx = fixture();
        fx.queue.fail_publishes(1);

        let result = fx.service.create_task(1, "send_email").await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));

        // No orphaned PENDING row may survive a failed publish.
        let tasks = fx.store.task_repository().get_by_user(1).await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn get_task_populates_the_cache_on_miss() {
        let fx = fixture();
        let id = fx.service.create_task(1, "send_email").await.unwrap();

        let key = cache::task_key(id);
        assert!(!fx.cache.contains(&key));

        let task = fx.service.get_task(id).await.unwrap();
        assert_eq!(task.id, id);
        assert!(fx.cache.contains(&key));
    }

    #[tokio::test]
    async fn get_task_serves_stale_cache_within_ttl() {
        let fx = fixture();
        let id = fx.service.create_task(1, "send_email").await.unwrap();

        // Populate the cache while the row is PENDING.
        let cached = fx.service.get_task(id).await.unwrap();
        assert_eq!(cached.status, TaskStatus::Pending);

        // A worker finalizes the row behind the cache's back.
        let tasks = fx.store.task_repository();
        conveyor_infra::with_transaction(&fx.store, |mut tx| async {
            tasks.mark_processing(&mut tx, id).await?;
            tasks.mark_success(&mut tx, id, "result.txt").await?;
            Ok::<_, conveyor_infra::StoreError>((tx, ()))
        })
        .await
        .unwrap();

        // The read path may lag actual task state up to the TTL.
        let stale = fx.service.get_task(id).await.unwrap();
        assert_eq!(stale.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.service.get_task(999).await,
            Err(ServiceError::NotFound("task"))
        ));
    }

    #[tokio::test]
    async fn list_tasks_returns_empty_for_unknown_user() {
        let fx = fixture();
        assert!(fx.service.list_tasks(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_tasks_scopes_by_owner() {
        let fx = fixture();
        fx.service.create_task(1, "send_email").await.unwrap();
        fx.service.create_task(1, "resize_image").await.unwrap();
        fx.service.create_task(2, "send_email").await.unwrap();

        let tasks = fx.service.list_tasks(1).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.user_id == 1));
    }
}
