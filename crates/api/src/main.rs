use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use conveyor_api::{build_router, AppState};
use conveyor_auth::TokenService;
use conveyor_infra::cache::RedisCache;
use conveyor_infra::queue::redis::RedisQueuePublisher;
use conveyor_infra::rate_limit::RateLimiter;
use conveyor_infra::repository::postgres::{PgTaskRepository, PgUserRepository};
use conveyor_infra::{cache, db, Config, Database, PgDatabase};
use conveyor_services::{AccountService, TaskService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conveyor_observability::init();

    let cfg = Config::from_env().context("failed to load configuration")?;

    let pool = db::connect(&cfg.database_url)
        .await
        .context("store unreachable")?;
    db::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    let (_client, manager) = cache::connect(&cfg.redis_url)
        .await
        .context("cache unreachable")?;

    let store: Arc<dyn Database> = Arc::new(PgDatabase::new(pool.clone()));
    let tokens = Arc::new(TokenService::new(&cfg.jwt_secret));

    let accounts = Arc::new(AccountService::new(
        store.clone(),
        Arc::new(PgUserRepository::new(pool.clone())),
        tokens.clone(),
    ));
    let tasks = Arc::new(TaskService::new(
        store,
        Arc::new(PgTaskRepository::new(pool)),
        Arc::new(RedisQueuePublisher::new(
            manager.clone(),
            cfg.queue.stream.clone(),
        )),
        Arc::new(RedisCache::new(manager.clone())),
    ));

    let state = AppState {
        accounts,
        tasks,
        tokens,
        limiter: Some(RateLimiter::new(manager)),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
