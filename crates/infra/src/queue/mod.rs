//! Durable work queue contracts.
//!
//! Delivery is at-least-once: consumers must tolerate duplicates. The retry
//! counter travels as a message header (`x-retry-count`), never in the task
//! row; republishing increments only that counter.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

use conveyor_core::TaskMessage;

/// Header carrying the transport-level retry counter.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("broker publish timed out")]
    Timeout,
}

impl From<QueueError> for conveyor_core::ServiceError {
    fn from(e: QueueError) -> Self {
        conveyor_core::ServiceError::unavailable(e.to_string())
    }
}

/// One unacknowledged delivery held by a consumer.
///
/// The body is raw: parsing is the consumer's first processing step, so a
/// malformed message can be dropped instead of poisoning the queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: String,
    pub body: Vec<u8>,
    pub retry_count: u32,
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publish a raw body with the given retry header.
    async fn publish_raw(&self, body: Vec<u8>, retry_count: u32) -> Result<(), QueueError>;

    /// Publish a task message with the given retry header.
    async fn publish(&self, message: &TaskMessage, retry_count: u32) -> Result<(), QueueError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.publish_raw(body, retry_count).await
    }
}

/// A single consumer channel with prefetch = 1: at most one unacknowledged
/// delivery is in flight per consumer, which is the pool's backpressure.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait briefly for the next delivery. `Ok(None)` means the wait timed
    /// out with nothing to do; callers just loop.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a processed delivery.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Negatively acknowledge. With `requeue` the delivery becomes eligible
    /// for redelivery; without it the message is dropped.
    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Publish a copy of this delivery's body with a new retry counter.
    /// The original delivery still needs its own ack.
    async fn republish(&mut self, delivery: &Delivery, retry_count: u32)
        -> Result<(), QueueError>;
}
