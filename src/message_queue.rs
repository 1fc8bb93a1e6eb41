/*!
 * # Message Queue Implementation
 *
 * Durable, at-least-once delivery of deletion events between services.
 * A message received through [`MessageQueue::subscribe`] stays in flight
 * until it is acked (removed for good) or nacked (put back on its queue
 * with an incremented retry count). There is no dead-letter queue; a
 * message is redelivered until a consumer acks it.
 */

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Unknown message: {0}")]
    UnknownMessage(Uuid),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<serde_json::Error> for MessageQueueError {
    fn from(err: serde_json::Error) -> Self {
        MessageQueueError::SerializationError(err.to_string())
    }
}

impl From<redis::RedisError> for MessageQueueError {
    fn from(err: redis::RedisError) -> Self {
        MessageQueueError::ConnectionError(err.to_string())
    }
}

/// Message envelope for queue items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Destination queue
    pub topic: String,
    /// Routing key the message was published with
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            routing_key: routing_key.into(),
            payload,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
        }
    }
}

/// Message queue trait for different implementations
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;
    /// Takes the next message off `topic` without waiting; it stays in
    /// flight until acked or nacked.
    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError>;
    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
    /// Returns an in-flight message to its queue for redelivery.
    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    queues: HashMap<String, VecDeque<Message>>,
    in_flight: HashMap<Uuid, Message>,
}

/// In-memory message queue implementation
#[derive(Debug, Clone)]
pub struct InMemoryMessageQueue {
    state: Arc<Mutex<InMemoryState>>,
    max_size: usize,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_max_size(10_000)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            max_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        // A panic while holding the lock leaves the maps consistent; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages waiting on `topic`, not counting in-flight ones.
    pub fn depth(&self, topic: &str) -> usize {
        self.lock().queues.get(topic).map(VecDeque::len).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut state = self.lock();
        let queue = state.queues.entry(message.topic.clone()).or_default();

        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }

        queue.push_back(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut state = self.lock();
        let next = state.queues.get_mut(topic).and_then(VecDeque::pop_front);
        if let Some(message) = &next {
            state.in_flight.insert(message.id, message.clone());
        }
        Ok(next)
    }

    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        self.lock()
            .in_flight
            .remove(message_id)
            .map(|_| ())
            .ok_or(MessageQueueError::UnknownMessage(*message_id))
    }

    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let mut state = self.lock();
        let mut message = state
            .in_flight
            .remove(message_id)
            .ok_or(MessageQueueError::UnknownMessage(*message_id))?;
        message.retry_count += 1;
        state
            .queues
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }
}

/// Redis-list backed queue. Each topic is a list `{namespace}:{topic}`;
/// delivery moves the message atomically into `{namespace}:{topic}:processing`
/// (`RPOPLPUSH`) so a crashed consumer does not lose it.
#[derive(Clone)]
pub struct RedisMessageQueue {
    conn: redis::aio::ConnectionManager,
    namespace: String,
    in_flight: Arc<DashMap<Uuid, (String, String)>>,
}

impl RedisMessageQueue {
    pub async fn connect(
        client: redis::Client,
        namespace: impl Into<String>,
    ) -> Result<Self, MessageQueueError> {
        let conn = redis::aio::ConnectionManager::new(client).await?;
        let namespace = namespace.into();
        info!(namespace = %namespace, "Connected redis message queue");
        Ok(Self {
            conn,
            namespace,
            in_flight: Arc::new(DashMap::new()),
        })
    }

    fn queue_key(&self, topic: &str) -> String {
        queue_key(&self.namespace, topic)
    }

    fn processing_key(&self, topic: &str) -> String {
        processing_key(&self.namespace, topic)
    }

    /// Moves messages left in `topic`'s processing list by a previous
    /// process back onto the queue. Call before consuming.
    pub async fn recover(&self, topic: &str) -> Result<usize, MessageQueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0usize;
        loop {
            let item: Option<String> = conn
                .rpoplpush(self.processing_key(topic), self.queue_key(topic))
                .await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!(topic, moved, "Requeued messages left in processing");
        }
        Ok(moved)
    }
}

fn queue_key(namespace: &str, topic: &str) -> String {
    format!("{}:{}", namespace, topic)
}

fn processing_key(namespace: &str, topic: &str) -> String {
    format!("{}:{}:processing", namespace, topic)
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let raw = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.queue_key(&message.topic), raw)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .rpoplpush(self.queue_key(topic), self.processing_key(topic))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Message>(&raw) {
            Ok(message) => {
                self.in_flight
                    .insert(message.id, (topic.to_string(), raw));
                Ok(Some(message))
            }
            Err(e) => {
                // Not ours to redeliver; drop it from processing.
                warn!(topic, error = %e, "Discarding undecodable queue entry");
                counter!("dtbank_mq.discarded", 1);
                conn.lrem::<_, _, ()>(self.processing_key(topic), 1, raw)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let (_, (topic, raw)) = self
            .in_flight
            .remove(message_id)
            .ok_or(MessageQueueError::UnknownMessage(*message_id))?;
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(self.processing_key(&topic), 1, raw)
            .await?;
        debug!(%message_id, topic = %topic, "Acked message");
        Ok(())
    }

    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let (_, (topic, raw)) = self
            .in_flight
            .remove(message_id)
            .ok_or(MessageQueueError::UnknownMessage(*message_id))?;
        let mut message: Message = serde_json::from_str(&raw)?;
        message.retry_count += 1;
        let requeued = serde_json::to_string(&message)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(&topic), 1, raw)
            .ignore()
            .lpush(self.queue_key(&topic), requeued)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(%message_id, topic = %topic, "Nacked message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn message(topic: &str) -> Message {
        Message::new(topic, format!("{topic}.X"), serde_json::json!({"test": "data"}))
    }

    #[tokio::test]
    async fn in_memory_queue_delivers_in_order() {
        let queue = InMemoryMessageQueue::new();
        let first = message("q");
        let second = message("q");
        queue.publish(first.clone()).await.unwrap();
        queue.publish(second.clone()).await.unwrap();

        assert_eq!(queue.subscribe("q").await.unwrap().unwrap().id, first.id);
        assert_eq!(queue.subscribe("q").await.unwrap().unwrap().id, second.id);
        assert!(queue.subscribe("q").await.unwrap().is_none());
        assert!(queue.subscribe("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_removes_in_flight_message() {
        let queue = InMemoryMessageQueue::new();
        queue.publish(message("q")).await.unwrap();

        let received = queue.subscribe("q").await.unwrap().unwrap();
        assert_eq!(queue.in_flight(), 1);
        queue.ack(&received.id).await.unwrap();

        assert_eq!(queue.in_flight(), 0);
        assert!(queue.subscribe("q").await.unwrap().is_none());
        assert_matches!(
            queue.ack(&received.id).await,
            Err(MessageQueueError::UnknownMessage(_))
        );
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_retry_count() {
        let queue = InMemoryMessageQueue::new();
        let original = message("q");
        queue.publish(original.clone()).await.unwrap();

        let received = queue.subscribe("q").await.unwrap().unwrap();
        queue.nack(&received.id).await.unwrap();
        assert_eq!(queue.depth("q"), 1);

        let redelivered = queue.subscribe("q").await.unwrap().unwrap();
        assert_eq!(redelivered.id, original.id);
        assert_eq!(redelivered.retry_count, 1);
        assert_eq!(redelivered.payload, original.payload);
    }

    #[tokio::test]
    async fn full_queue_rejects_publish() {
        let queue = InMemoryMessageQueue::with_max_size(1);
        queue.publish(message("q")).await.unwrap();
        assert_matches!(
            queue.publish(message("q")).await,
            Err(MessageQueueError::QueueFull)
        );
    }

    #[test]
    fn redis_keys_are_namespaced() {
        assert_eq!(queue_key("dtbank:mq", "QUEUE_DELETE_CUSTOMER"), "dtbank:mq:QUEUE_DELETE_CUSTOMER");
        assert_eq!(
            processing_key("dtbank:mq", "QUEUE_DELETE_ACCOUNT"),
            "dtbank:mq:QUEUE_DELETE_ACCOUNT:processing"
        );
    }
}
