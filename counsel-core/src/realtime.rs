use async_trait::async_trait;
use futures::stream::BoxStream;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing;

use crate::error::Result;
use crate::redis::{get_connection, RedisPool};

/// Payloads published on one topic, in publish order.
pub type Subscription = BoxStream<'static, String>;

/// Publish/subscribe-by-topic transport behind change notifications and
/// the call signal mailboxes. Delivery is at most once per subscriber.
#[async_trait]
pub trait RealtimeBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Only payloads published after this call returns are delivered.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

pub mod topics {
    use uuid::Uuid;

    pub fn chat(chat_id: Uuid) -> String {
        format!("chat:{}", chat_id)
    }

    pub fn unread(user_id: Uuid) -> String {
        format!("unread:{}", user_id)
    }

    pub fn signals(user_id: Uuid) -> String {
        format!("signal:{}", user_id)
    }

    pub fn connections(user_id: Uuid) -> String {
        format!("connections:{}", user_id)
    }
}

const MEMORY_TOPIC_CAPACITY: usize = 256;

/// In-process bus for tests and single-node development.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Topics with a live sender. A topic is dropped once its last
    /// subscriber is gone.
    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }
}

#[async_trait]
impl RealtimeBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut topics = self.topics();
        // No receivers is not an error: nobody is listening yet.
        let Some(tx) = topics.get(topic) else {
            return Ok(());
        };
        if tx.send(payload.to_string()).is_err() {
            topics.remove(topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let rx = {
            let mut topics = self.topics();
            topics.retain(|_, tx| tx.receiver_count() > 0);
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
                .subscribe()
        };
        let topic = topic.to_string();
        let stream = futures::stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %topic, skipped, "Subscriber lagged, payloads dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

const STREAM_MAXLEN: usize = 1000;
const READ_BLOCK_MS: usize = 1000;

/// Redis streams bus: one `STREAM:{topic}` per topic, read with `XREAD BLOCK`.
#[derive(Clone)]
pub struct RedisBus {
    pool: RedisPool,
}

impl RedisBus {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn stream_key(topic: &str) -> String {
        format!("STREAM:{}", topic)
    }
}

#[async_trait]
impl RealtimeBus for RedisBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        let _: String = conn
            .xadd_maxlen(
                Self::stream_key(topic),
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[("data", payload)],
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let stream_key = Self::stream_key(topic);
        // Blocking reads get their own connection so they never stall publishers.
        let mut conn = get_connection(&self.pool).await?;

        let newest: StreamRangeReply = conn.xrevrange_count(&stream_key, "+", "-", 1).await?;
        let mut last_id = newest
            .ids
            .first()
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|| "0-0".to_string());

        let (tx, mut rx) = mpsc::channel::<String>(MEMORY_TOPIC_CAPACITY);

        tokio::spawn(async move {
            let options = StreamReadOptions::default().block(READ_BLOCK_MS).count(100);
            loop {
                let reply: std::result::Result<Option<StreamReadReply>, redis::RedisError> = conn
                    .xread_options(&[&stream_key], &[&last_id], &options)
                    .await;

                match reply {
                    Ok(Some(reply)) => {
                        for key in reply.keys {
                            for entry in key.ids {
                                last_id = entry.id.clone();
                                let Some(data) = entry.get::<String>("data") else {
                                    continue;
                                };
                                if tx.send(data).await.is_err() {
                                    tracing::debug!(stream = %stream_key, "Subscriber dropped, stopping reader");
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        if tx.is_closed() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!(stream = %stream_key, "Redis stream read error: {}", e);
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(Box::pin(stream))
    }
}

/// Serializes `value` as JSON and publishes it.
pub async fn publish_json<T: serde::Serialize + ?Sized>(
    bus: &dyn RealtimeBus,
    topic: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_string(value)?;
    bus.publish(topic, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_memory_bus_delivers_in_publish_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("chat:1").await.unwrap();

        bus.publish("chat:1", "a").await.unwrap();
        bus.publish("chat:1", "b").await.unwrap();
        bus.publish("chat:2", "other").await.unwrap();

        assert_eq!(sub.next().await.unwrap(), "a");
        assert_eq!(sub.next().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_memory_bus_skips_payloads_before_subscribe() {
        let bus = MemoryBus::new();
        bus.publish("signal:x", "early").await.unwrap();

        let mut sub = bus.subscribe("signal:x").await.unwrap();
        bus.publish("signal:x", "late").await.unwrap();

        assert_eq!(sub.next().await.unwrap(), "late");
    }

    #[tokio::test]
    async fn test_memory_bus_drops_topics_without_subscribers() {
        let bus = MemoryBus::new();
        bus.publish("unread:nobody", "1").await.unwrap();
        assert_eq!(bus.topic_count(), 0);

        let sub = bus.subscribe("chat:1").await.unwrap();
        let mut kept = bus.subscribe("chat:2").await.unwrap();
        assert_eq!(bus.topic_count(), 2);

        drop(sub);
        bus.publish("chat:1", "unheard").await.unwrap();
        assert_eq!(bus.topic_count(), 1);

        bus.publish("chat:2", "heard").await.unwrap();
        assert_eq!(kept.next().await.unwrap(), "heard");
        assert_eq!(bus.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_bus_sweeps_stale_topics_on_subscribe() {
        let bus = MemoryBus::new();
        for i in 0..10 {
            let sub = bus.subscribe(&format!("signal:{}", i)).await.unwrap();
            drop(sub);
        }
        let _live = bus.subscribe("signal:live").await.unwrap();
        assert_eq!(bus.topic_count(), 1);
    }
}
