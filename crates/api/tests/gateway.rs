//! Black-box gateway tests: the real router served on an ephemeral port,
//! backed by the in-memory store, queue, and cache.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use conveyor_api::{build_router, AppState};
use conveyor_auth::{TokenService, TokenType};
use conveyor_infra::cache::InMemoryCache;
use conveyor_infra::queue::memory::InMemoryQueue;
use conveyor_infra::repository::memory::InMemoryStore;
use conveyor_infra::repository::TaskRepository;
use conveyor_infra::Database;
use conveyor_services::{AccountService, TaskService};
use conveyor_worker::{run_worker, HandlerRegistry, HandlerResult, WorkerContext};

struct TestServer {
    base_url: String,
    store: InMemoryStore,
    queue: InMemoryQueue,
    tokens: Arc<TokenService>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new();
        let cache = InMemoryCache::new();
        let tokens = Arc::new(TokenService::new("test-secret"));

        let db: Arc<dyn Database> = Arc::new(store.clone());
        let accounts = Arc::new(AccountService::new(
            db.clone(),
            Arc::new(store.user_repository()),
            tokens.clone(),
        ));
        let tasks = Arc::new(TaskService::new(
            db,
            Arc::new(store.task_repository()),
            Arc::new(queue.clone()),
            Arc::new(cache),
        ));

        let app = build_router(AppState {
            accounts,
            tasks,
            tokens: tokens.clone(),
            limiter: None,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            queue,
            tokens,
            handle,
        }
    }

    /// Spawn a worker pool against the same store and queue.
    fn spawn_worker(&self) -> tokio::sync::watch::Sender<bool> {
        let mut handlers = HandlerRegistry::new();
        handlers.register("send_email", |_msg| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            HandlerResult::Success {
                result_file: "result.txt".to_string(),
            }
        });

        let ctx = WorkerContext {
            db: Arc::new(self.store.clone()),
            tasks: Arc::new(self.store.task_repository()),
            handlers: Arc::new(handlers),
        };

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(run_worker(1, self.queue.consumer(), ctx, shutdown_rx));
        shutdown_tx
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn register_and_login(srv: &TestServer, username: &str) -> (i64, String, String) {
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/auth/register", srv.base_url))
        .json(&json!({ "username": username, "password": "Pw123!" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    let user_id = body["user_id"].as_i64().unwrap();

    let res = client
        .post(format!("{}/auth/login", srv.base_url))
        .json(&json!({ "username": username, "password": "Pw123!" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();

    (
        user_id,
        body["access_token"].as_str().unwrap().to_string(),
        body["refresh_token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn health_is_public_and_api_requires_auth() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!("{}/api/v1/users/tasks", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/api/v1/users/tasks", srv.base_url))
        .bearer_auth("garbage-token")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registration_validation_boundaries() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for (username, password) in [("ab", "Pw123!"), ("alice", "12345")] {
        let res = client
            .post(format!("{}/auth/register", srv.base_url))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    let res = client
        .post(format!("{}/auth/register", srv.base_url))
        .json(&json!({ "username": "abc", "password": "123456" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    // Same username again conflicts.
    let res = client
        .post(format!("{}/auth/register", srv.base_url))
        .json(&json!({ "username": "abc", "password": "123456" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn login_does_not_leak_account_existence() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    register_and_login(&srv, "alice").await;

    let mut messages = Vec::new();
    for (username, password) in [("ghost", "Pw123!"), ("alice", "wrong-pass")] {
        let res = client
            .post(format!("{}/auth/login", srv.base_url))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = res.json().await.unwrap();
        messages.push(body["message"].as_str().unwrap().to_string());
    }
    assert_eq!(messages[0], messages[1]);
}

#[tokio::test]
async fn create_and_read_own_tasks() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (user_id, access, _) = register_and_login(&srv, "alice").await;

    let res = client
        .post(format!("{}/api/v1/tasks", srv.base_url))
        .bearer_auth(&access)
        .json(&json!({ "task_type": "send_email" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    assert_eq!(created["status"], "PENDING");
    let task_id = created["task_id"].as_i64().unwrap();
    assert_eq!(srv.queue.ready_len(), 1);

    let res = client
        .get(format!("{}/api/v1/tasks/{}", srv.base_url, task_id))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let task: serde_json::Value = res.json().await.unwrap();
    assert_eq!(task["id"].as_i64().unwrap(), task_id);
    assert_eq!(task["user_id"].as_i64().unwrap(), user_id);
    assert_eq!(task["status"], "PENDING");

    let res = client
        .get(format!("{}/api/v1/users/tasks", srv.base_url))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let listing: serde_json::Value = res.json().await.unwrap();
    assert_eq!(listing["count"].as_u64().unwrap(), 1);
}

#[tokio::test]
async fn task_creation_requires_a_task_type() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (_, access, _) = register_and_login(&srv, "alice").await;

    for body in [json!({}), json!({ "task_type": "" })] {
        let res = client
            .post(format!("{}/api/v1/tasks", srv.base_url))
            .bearer_auth(&access)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn ownership_is_enforced_on_reads() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (_, alice, _) = register_and_login(&srv, "alice").await;
    let (_, bob, _) = register_and_login(&srv, "bob").await;

    let res = client
        .post(format!("{}/api/v1/tasks", srv.base_url))
        .bearer_auth(&alice)
        .json(&json!({ "task_type": "send_email" }))
        .send()
        .await
        .unwrap();
    let task_id = res.json::<serde_json::Value>().await.unwrap()["task_id"]
        .as_i64()
        .unwrap();

    // Bob cannot read Alice's task.
    let res = client
        .get(format!("{}/api/v1/tasks/{}", srv.base_url, task_id))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("only view your own tasks"));

    // Bob's own listing is empty.
    let res = client
        .get(format!("{}/api/v1/users/tasks", srv.base_url))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    let listing: serde_json::Value = res.json().await.unwrap();
    assert_eq!(listing["count"].as_u64().unwrap(), 0);

    // A task id that was never issued is a 404, not a 403.
    let res = client
        .get(format!("{}/api/v1/tasks/999999", srv.base_url))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn refresh_rotates_and_rejects_access_tokens() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (user_id, access, refresh) = register_and_login(&srv, "alice").await;

    let res = client
        .post(format!("{}/auth/refresh", srv.base_url))
        .json(&json!({ "refresh_token": refresh }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let rotated: serde_json::Value = res.json().await.unwrap();

    // Both the old and the new access token decode to the same identity.
    let rotated_access = rotated["access_token"].as_str().unwrap();
    for token in [access.as_str(), rotated_access] {
        let claims = srv.tokens.validate(token, TokenType::Access).unwrap();
        assert_eq!(claims.user_id, user_id);
    }

    // An access token submitted for refresh is rejected.
    let res = client
        .post(format!("{}/auth/refresh", srv.base_url))
        .json(&json!({ "refresh_token": access }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn worker_drives_task_to_success() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (_, access, _) = register_and_login(&srv, "alice").await;
    let shutdown = srv.spawn_worker();

    let res = client
        .post(format!("{}/api/v1/tasks", srv.base_url))
        .bearer_auth(&access)
        .json(&json!({ "task_type": "send_email" }))
        .send()
        .await
        .unwrap();
    let task_id = res.json::<serde_json::Value>().await.unwrap()["task_id"]
        .as_i64()
        .unwrap();

    // Wait for the worker to finish the task before the first read, so the
    // cache is populated with the terminal state.
    let tasks = srv.store.task_repository();
    let mut finished = None;
    for _ in 0..100 {
        let task = tasks.get_by_id(task_id).await.unwrap().unwrap();
        if task.status.is_terminal() {
            finished = Some(task);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let finished = finished.expect("task did not reach a terminal state in time");
    assert_eq!(finished.status, conveyor_core::TaskStatus::Success);

    let res = client
        .get(format!("{}/api/v1/tasks/{}", srv.base_url, task_id))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    let task: serde_json::Value = res.json().await.unwrap();
    assert_eq!(task["status"], "SUCCESS");
    assert_eq!(task["result_file"], "result.txt");
    assert!(task["error_message"].is_null());

    let _ = shutdown.send(true);
}
