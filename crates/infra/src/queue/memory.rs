//! In-memory queue with the same delivery semantics as the stream-backed
//! one: unacknowledged deliveries are tracked, rejection with requeue makes
//! a message deliverable again, and publish failures can be injected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Delivery, QueueConsumer, QueueError, QueuePublisher};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>, u32)>,
    in_flight: HashMap<u64, (Vec<u8>, u32)>,
    next_tag: u64,
    failing_publishes: u32,
}

/// Shared in-memory queue. Clones share state; consumers pull from the same
/// ready list, so each message is delivered to exactly one of them.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer(&self) -> InMemoryQueueConsumer {
        InMemoryQueueConsumer {
            state: self.state.clone(),
        }
    }

    /// Make the next `count` publishes fail.
    pub fn fail_publishes(&self, count: u32) {
        self.state.lock().unwrap().failing_publishes = count;
    }

    /// Messages waiting for delivery.
    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }
}

#[async_trait]
impl QueuePublisher for InMemoryQueue {
    async fn publish_raw(&self, body: Vec<u8>, retry_count: u32) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(QueueError::Connection(
                "injected publish failure".to_string(),
            ));
        }
        let tag = state.next_tag;
        state.next_tag += 1;
        state.ready.push_back((tag, body, retry_count));
        Ok(())
    }
}

pub struct InMemoryQueueConsumer {
    state: Arc<Mutex<QueueState>>,
}

fn parse_tag(delivery: &Delivery) -> Result<u64, QueueError> {
    delivery
        .tag
        .parse::<u64>()
        .map_err(|_| QueueError::Command(format!("unknown delivery tag: {}", delivery.tag)))
}

#[async_trait]
impl QueueConsumer for InMemoryQueueConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some((tag, body, retry_count)) = state.ready.pop_front() {
                state.in_flight.insert(tag, (body.clone(), retry_count));
                return Ok(Some(Delivery {
                    tag: tag.to_string(),
                    body,
                    retry_count,
                }));
            }
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(None)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        let tag = parse_tag(delivery)?;
        self.state.lock().unwrap().in_flight.remove(&tag);
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let tag = parse_tag(delivery)?;
        let mut state = self.state.lock().unwrap();
        if let Some((body, retry_count)) = state.in_flight.remove(&tag) {
            if requeue {
                state.ready.push_front((tag, body, retry_count));
            }
        }
        Ok(())
    }

    async fn republish(
        &mut self,
        delivery: &Delivery,
        retry_count: u32,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let tag = state.next_tag;
        state.next_tag += 1;
        state.ready.push_back((tag, delivery.body.clone(), retry_count));
        Ok(())
    }
}
