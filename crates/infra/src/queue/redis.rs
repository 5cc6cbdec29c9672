//! Redis Streams implementation of the work queue.
//!
//! A single durable stream holds the task messages; the worker pool shares
//! one consumer group, so each entry is delivered to exactly one consumer at
//! a time. Reads use `COUNT 1` (prefetch = 1) and entries stay in the
//! pending list until acknowledged, giving at-least-once delivery. Entries
//! left pending by a crashed or stalled consumer are reclaimed with
//! `XAUTOCLAIM` once their idle time passes the redelivery threshold.
//!
//! Message layout: field `payload` carries the JSON body, field
//! `x-retry-count` the transport retry counter.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::{Delivery, QueueConsumer, QueueError, QueuePublisher, RETRY_COUNT_HEADER};

/// Enqueue-path deadline; a slower broker surfaces as Unavailable upstream.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// How long XREADGROUP blocks waiting for new entries.
const BLOCK_MS: u64 = 5_000;

/// Idle time after which another consumer may reclaim a pending entry.
const CLAIM_MIN_IDLE_MS: u64 = 60_000;

/// Create the consumer group (and stream) if they do not exist yet.
pub async fn ensure_group(
    client: &redis::Client,
    stream: &str,
    group: &str,
) -> Result<(), QueueError> {
    let mut conn = client
        .get_async_connection()
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

    // Starting at "0" replays any entries published before the group existed.
    let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;

    match created {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
    }
}

/// Publisher used by the enqueue path.
#[derive(Clone)]
pub struct RedisQueuePublisher {
    conn: ConnectionManager,
    stream: String,
}

impl RedisQueuePublisher {
    pub fn new(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl QueuePublisher for RedisQueuePublisher {
    async fn publish_raw(&self, body: Vec<u8>, retry_count: u32) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut xadd = redis::cmd("XADD");
        xadd.arg(&self.stream)
            .arg("*")
            .arg("payload")
            .arg(&body)
            .arg(RETRY_COUNT_HEADER)
            .arg(retry_count);

        match tokio::time::timeout(PUBLISH_DEADLINE, xadd.query_async::<_, String>(&mut conn)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(QueueError::Command(format!("XADD failed: {e}"))),
            Err(_) => Err(QueueError::Timeout),
        }
    }
}

/// One worker's consumer channel. Owns a dedicated connection because reads
/// block server-side.
pub struct RedisQueueConsumer {
    conn: redis::aio::Connection,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisQueueConsumer {
    pub async fn connect(
        client: &redis::Client,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        })
    }

    /// Reclaim one entry another consumer left pending past the idle
    /// threshold. Redelivery after a worker crash comes from here.
    async fn claim_stale(&mut self) -> Result<Option<Delivery>, QueueError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(CLAIM_MIN_IDLE_MS)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| QueueError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply shape: [next-cursor, [[id, fields], ...], ...]
        let redis::Value::Bulk(parts) = reply else {
            return Ok(None);
        };
        let Some(redis::Value::Bulk(entries)) = parts.get(1) else {
            return Ok(None);
        };

        match entries.first() {
            Some(entry) => match parse_entry(entry) {
                Ok(delivery) => Ok(Some(delivery)),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable reclaimed entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn read_new(&mut self) -> Result<Option<Delivery>, QueueError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        // Nil means the blocking read timed out with nothing new.
        let redis::Value::Bulk(streams) = reply else {
            return Ok(None);
        };

        for stream in &streams {
            let redis::Value::Bulk(pair) = stream else {
                continue;
            };
            let Some(redis::Value::Bulk(entries)) = pair.get(1) else {
                continue;
            };
            if let Some(entry) = entries.first() {
                return parse_entry(entry).map(Some);
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl QueueConsumer for RedisQueueConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        if let Some(delivery) = self.claim_stale().await? {
            return Ok(Some(delivery));
        }
        self.read_new().await
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&delivery.tag)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            // Leaving the entry pending makes it eligible for reclaim once
            // its idle time passes the threshold.
            return Ok(());
        }
        self.ack(delivery).await
    }

    async fn republish(
        &mut self,
        delivery: &Delivery,
        retry_count: u32,
    ) -> Result<(), QueueError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("payload")
            .arg(&delivery.body)
            .arg(RETRY_COUNT_HEADER)
            .arg(retry_count)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }
}

/// Parse one stream entry: `[message_id, [field, value, ...]]`.
fn parse_entry(entry: &redis::Value) -> Result<Delivery, QueueError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Command("invalid stream entry format".to_string()));
    };
    if parts.len() < 2 {
        return Err(QueueError::Command("stream entry too short".to_string()));
    }

    let redis::Value::Data(id) = &parts[0] else {
        return Err(QueueError::Command("invalid stream entry id".to_string()));
    };
    let tag = String::from_utf8_lossy(id).to_string();

    let redis::Value::Bulk(field_values) = &parts[1] else {
        return Err(QueueError::Command("invalid stream entry fields".to_string()));
    };

    let mut body = None;
    let mut retry_count = 0u32;
    for chunk in field_values.chunks(2) {
        let [redis::Value::Data(key), redis::Value::Data(value)] = chunk else {
            continue;
        };
        if key.as_slice() == b"payload" {
            body = Some(value.clone());
        } else if key.as_slice() == RETRY_COUNT_HEADER.as_bytes() {
            retry_count = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
        }
    }

    let body = body
        .ok_or_else(|| QueueError::Command("stream entry missing payload field".to_string()))?;

    Ok(Delivery {
        tag,
        body,
        retry_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn entry(id: &str, fields: Vec<(&str, &[u8])>) -> Value {
        let mut flat = Vec::new();
        for (k, v) in fields {
            flat.push(Value::Data(k.as_bytes().to_vec()));
            flat.push(Value::Data(v.to_vec()));
        }
        Value::Bulk(vec![
            Value::Data(id.as_bytes().to_vec()),
            Value::Bulk(flat),
        ])
    }

    #[test]
    fn parses_payload_and_retry_header() {
        let parsed = parse_entry(&entry(
            "1700000000-0",
            vec![
                ("payload", br#"{"id":1,"user_id":2,"task_type":"send_email"}"#),
                ("x-retry-count", b"2"),
            ],
        ))
        .unwrap();

        assert_eq!(parsed.tag, "1700000000-0");
        assert_eq!(parsed.retry_count, 2);
        assert_eq!(
            parsed.body,
            br#"{"id":1,"user_id":2,"task_type":"send_email"}"#
        );
    }

    #[test]
    fn missing_retry_header_defaults_to_zero() {
        let parsed =
            parse_entry(&entry("1-0", vec![("payload", b"{}")])).unwrap();
        assert_eq!(parsed.retry_count, 0);
    }

    #[test]
    fn entry_without_payload_is_an_error() {
        assert!(parse_entry(&entry("1-0", vec![("x-retry-count", b"1")])).is_err());
        assert!(parse_entry(&Value::Nil).is_err());
    }
}
