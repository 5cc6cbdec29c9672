//! Router construction and request handlers.

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use conveyor_auth::TokenService;
use conveyor_core::ServiceError;
use conveyor_infra::rate_limit::{RateLimiter, RateLimiterConfig};
use conveyor_services::{AccountService, TaskService};

use crate::dto::{CreateTaskRequest, LoginRequest, RefreshRequest, RegisterRequest};
use crate::errors::ApiError;
use crate::middleware::{
    auth_middleware, rate_limit_middleware, AuthState, CurrentUser, RateLimitState,
};

#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountService>,
    pub tasks: Arc<TaskService>,
    pub tokens: Arc<TokenService>,
    pub limiter: Option<RateLimiter>,
}

/// Build the full HTTP router.
pub fn build_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh));

    // Writes get the default bucket, reads the generous one.
    let writes = Router::new()
        .route("/tasks", post(create_task))
        .route_layer(axum::middleware::from_fn_with_state(
            RateLimitState {
                limiter: state.limiter.clone(),
                config: RateLimiterConfig::moderate(),
            },
            rate_limit_middleware,
        ));

    let reads = Router::new()
        .route("/tasks/:id", get(get_task))
        .route("/users/tasks", get(list_own_tasks))
        .route_layer(axum::middleware::from_fn_with_state(
            RateLimitState {
                limiter: state.limiter.clone(),
                config: RateLimiterConfig::generous(),
            },
            rate_limit_middleware,
        ));

    let api_v1 = writes.merge(reads).route_layer(
        axum::middleware::from_fn_with_state(
            AuthState {
                tokens: state.tokens.clone(),
            },
            auth_middleware,
        ),
    );

    Router::new()
        .route("/health", get(health))
        .nest("/auth", auth_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = body.username.unwrap_or_default();
    let password = body.password.unwrap_or_default();

    let user_id = state.accounts.register(&username, &password).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "user_id": user_id,
            "message": "user created successfully",
        })),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = body.username.unwrap_or_default();
    let password = body.password.unwrap_or_default();
    if username.is_empty() || password.is_empty() {
        return Err(ApiError(ServiceError::validation(
            "username and password are required",
        )));
    }

    let pair = state.accounts.login(&username, &password).await?;
    Ok(Json(pair))
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = body
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or(ApiError(ServiceError::validation("refresh_token is required")))?;

    let pair = state.accounts.refresh(&token).await?;
    Ok(Json(json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "token_type": "Bearer",
        "expires_in": pair.expires_in,
    })))
}

async fn create_task(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task_type = body.task_type.unwrap_or_default();
    let task_id = state.tasks.create_task(user.0, &task_type).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "task_id": task_id,
            "status": "PENDING",
            "message": "task created successfully",
        })),
    ))
}

async fn get_task(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.get_task(task_id).await?;

    if task.user_id != user.0 {
        return Err(ApiError(ServiceError::forbidden(
            "you can only view your own tasks",
        )));
    }

    Ok(Json(task))
}

async fn list_own_tasks(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.tasks.list_tasks(user.0).await?;
    let count = tasks.len();

    Ok(Json(json!({ "tasks": tasks, "count": count })))
}
