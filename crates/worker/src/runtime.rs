//! Consumer runtime: per-message processing with claim/execute/finalize
//! transactions and bounded republish retry.
//!
//! Delivery is at-least-once, so everything here is written against
//! duplicates: a claim against a terminal row is a no-op acknowledge, and
//! status transitions never regress. The retry counter lives in the message
//! header; a finalize failure republishes with the counter incremented until
//! it exhausts, at which point the row is failed with the max-retries marker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use conveyor_core::TaskMessage;
use conveyor_infra::queue::{Delivery, QueueConsumer, QueueError};
use conveyor_infra::repository::{Claim, TaskRepository};
use conveyor_infra::{with_transaction, Database, StoreError};

use crate::handlers::{HandlerRegistry, HandlerResult};

/// Finalize-path retries before a task is failed outright.
pub const MAX_RETRIES: u32 = 3;

/// Consecutive queue errors tolerated before a worker gives up; a closed
/// broker connection never recovers on its own.
const MAX_CONSECUTIVE_QUEUE_ERRORS: u32 = 5;

/// Shared dependencies of every worker in the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Arc<dyn Database>,
    pub tasks: Arc<dyn TaskRepository>,
    pub handlers: Arc<HandlerRegistry>,
}

/// Run one worker until shutdown is signalled or the broker goes away.
///
/// A delivery in flight when shutdown lands is simply abandoned
/// unacknowledged; the broker redelivers it to a surviving consumer.
pub async fn run_worker<C: QueueConsumer>(
    worker_id: usize,
    mut consumer: C,
    ctx: WorkerContext,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "worker started");

    let mut consecutive_errors = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            polled = poll_once(worker_id, &mut consumer, &ctx) => match polled {
                Ok(_) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_QUEUE_ERRORS {
                        error!(worker_id, error = %e, "broker unreachable, stopping worker");
                        break;
                    }
                    warn!(worker_id, error = %e, "queue read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    info!(worker_id, "worker stopped");
}

/// Wait for at most one delivery and process it. Returns whether a delivery
/// was handled.
pub async fn poll_once<C: QueueConsumer>(
    worker_id: usize,
    consumer: &mut C,
    ctx: &WorkerContext,
) -> Result<bool, QueueError> {
    match consumer.next_delivery().await? {
        Some(delivery) => {
            process_delivery(worker_id, consumer, ctx, delivery).await;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn process_delivery<C: QueueConsumer>(
    worker_id: usize,
    consumer: &mut C,
    ctx: &WorkerContext,
    delivery: Delivery,
) {
    // 1. Parse. A malformed body is dropped without requeue so it cannot
    //    loop as a poison pill.
    let message: TaskMessage = match serde_json::from_slice(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            error!(worker_id, error = %e, "invalid message payload, dropping");
            reject(consumer, &delivery, false, worker_id).await;
            return;
        }
    };

    let retry_count = delivery.retry_count;
    info!(
        worker_id,
        task_id = message.id,
        task_type = %message.task_type,
        user_id = message.user_id,
        retry_count,
        "processing task"
    );

    // 2. Claim: move the row to PROCESSING in its own transaction.
    let claim = with_transaction(&*ctx.db, |mut tx| async {
        let claim = ctx.tasks.mark_processing(&mut tx, message.id).await?;
        Ok::<_, StoreError>((tx, claim))
    })
    .await;

    match claim {
        Ok(Claim::Claimed) => {}
        Ok(Claim::AlreadyTerminal) => {
            // Duplicate delivery of finished work; acknowledging it is the
            // whole job.
            info!(
                worker_id,
                task_id = message.id,
                "task already terminal, acknowledging duplicate delivery"
            );
            ack(consumer, &delivery, worker_id).await;
            return;
        }
        Ok(Claim::NotFound) => {
            // An enqueue transaction that published and then failed to
            // commit leaks a message with no row behind it.
            warn!(
                worker_id,
                task_id = message.id,
                "message references unknown task, dropping"
            );
            reject(consumer, &delivery, false, worker_id).await;
            return;
        }
        Err(e) => {
            error!(worker_id, task_id = message.id, error = %e, "failed to mark task as processing");
            reject(consumer, &delivery, true, worker_id).await;
            return;
        }
    }

    // 3. Execute outside any store transaction.
    let started = Instant::now();
    let outcome = ctx.handlers.execute(&message).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match &outcome {
        HandlerResult::Success { .. } => {
            info!(worker_id, task_id = message.id, duration_ms, "task handler succeeded");
        }
        HandlerResult::Failure { message: cause } => {
            error!(
                worker_id,
                task_id = message.id,
                duration_ms,
                error = %cause,
                "task handler failed"
            );
        }
    }

    // 4. Finalize: record the outcome in a second transaction.
    let finalized = with_transaction(&*ctx.db, |mut tx| async {
        match &outcome {
            HandlerResult::Success { result_file } => {
                ctx.tasks.mark_success(&mut tx, message.id, result_file).await?;
            }
            HandlerResult::Failure { message: cause } => {
                ctx.tasks.mark_failed(&mut tx, message.id, cause).await?;
            }
        }
        Ok::<_, StoreError>((tx, ()))
    })
    .await;

    // 5. Acknowledge, or retry through the republish counter.
    match finalized {
        Ok(()) => ack(consumer, &delivery, worker_id).await,
        Err(e) => {
            error!(worker_id, task_id = message.id, error = %e, "failed to record task outcome");

            if retry_count >= MAX_RETRIES {
                let gave_up = with_transaction(&*ctx.db, |mut tx| async {
                    ctx.tasks
                        .mark_failed(&mut tx, message.id, "max retries reached")
                        .await?;
                    Ok::<_, StoreError>((tx, ()))
                })
                .await;

                if let Err(e) = gave_up {
                    error!(
                        worker_id,
                        task_id = message.id,
                        error = %e,
                        "failed to fail task after max retries"
                    );
                }
                reject(consumer, &delivery, false, worker_id).await;
                return;
            }

            info!(
                worker_id,
                task_id = message.id,
                retry = retry_count + 1,
                max_retries = MAX_RETRIES,
                "status update failed, requeuing task"
            );
            if let Err(e) = consumer.republish(&delivery, retry_count + 1).await {
                error!(worker_id, task_id = message.id, error = %e, "failed to republish message");
                reject(consumer, &delivery, false, worker_id).await;
                return;
            }
            ack(consumer, &delivery, worker_id).await;
        }
    }
}

async fn ack<C: QueueConsumer>(consumer: &mut C, delivery: &Delivery, worker_id: usize) {
    if let Err(e) = consumer.ack(delivery).await {
        error!(worker_id, tag = %delivery.tag, error = %e, "failed to acknowledge delivery");
    }
}

async fn reject<C: QueueConsumer>(
    consumer: &mut C,
    delivery: &Delivery,
    requeue: bool,
    worker_id: usize,
) {
    if let Err(e) = consumer.reject(delivery, requeue).await {
        error!(worker_id, tag = %delivery.tag, error = %e, "failed to reject delivery");
    }
}
