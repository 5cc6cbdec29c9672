use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use conveyor_infra::queue::redis::{ensure_group, RedisQueueConsumer};
use conveyor_infra::repository::postgres::PgTaskRepository;
use conveyor_infra::repository::TaskRepository;
use conveyor_infra::{cache, db, Config, Database, PgDatabase};
use conveyor_worker::{run_worker, HandlerRegistry, WorkerContext};

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

    let (client, _manager) = cache::connect(&cfg.redis_url)
        .await
        .context("broker unreachable")?;
    ensure_group(&client, &cfg.queue.stream, &cfg.queue.group)
        .await
        .context("failed to create consumer group")?;

    let db: Arc<dyn Database> = Arc::new(PgDatabase::new(pool.clone()));
    let tasks: Arc<dyn TaskRepository> = Arc::new(PgTaskRepository::new(pool));
    let ctx = WorkerContext {
        db,
        tasks,
        handlers: Arc::new(HandlerRegistry::builtin()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(cfg.worker_count);
    for worker_id in 1..=cfg.worker_count {
        let consumer_name = format!("worker-{}", uuid::Uuid::now_v7());
        let consumer = RedisQueueConsumer::connect(
            &client,
            &cfg.queue.stream,
            &cfg.queue.group,
            consumer_name,
        )
        .await
        .context("failed to open consumer channel")?;

        workers.push(tokio::spawn(run_worker(
            worker_id,
            consumer,
            ctx.clone(),
            shutdown_rx.clone(),
        )));
    }
    info!(workers = cfg.worker_count, stream = %cfg.queue.stream, "worker pool started");

    shutdown_signal().await;
    info!("shutting down worker pool");

    // In-flight deliveries stay unacknowledged; the broker redelivers them.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

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
