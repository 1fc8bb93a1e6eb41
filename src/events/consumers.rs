//! Queue subscriptions: one handler per queue, registered at startup.

use crate::errors::ServiceError;
use crate::events::DeletionEvent;
use crate::message_queue::{Message, MessageQueue, MessageQueueError};
use futures::future::BoxFuture;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn, Instrument};

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Debug)]
pub enum HandlerError {
    /// Payload did not match the queue's event shape.
    Decode(serde_json::Error),
    Failed(ServiceError),
}

/// Outcome of handing one message to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acked,
    Requeued,
    /// Poison message: logged and acked so it is not redelivered forever.
    Discarded,
}

#[derive(Clone, Default)]
pub struct Subscriptions {
    handlers: HashMap<&'static str, Handler>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for the queue bound to event type `E`.
    pub fn on<E, F, Fut>(mut self, handler: F) -> Self
    where
        E: DeletionEvent + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(
            move |payload: Value| -> BoxFuture<'static, Result<(), HandlerError>> {
                let handler = handler.clone();
                Box::pin(async move {
                    let event: E =
                        serde_json::from_value(payload).map_err(HandlerError::Decode)?;
                    handler(event).await.map_err(HandlerError::Failed)
                })
            },
        );
        self.handlers.insert(E::BINDING.queue, erased);
        self
    }

    pub fn queues(&self) -> Vec<&'static str> {
        let mut queues: Vec<_> = self.handlers.keys().copied().collect();
        queues.sort_unstable();
        queues
    }

    /// Runs the handler for `message` and acks or nacks it accordingly.
    pub async fn deliver(
        &self,
        queue: &dyn MessageQueue,
        message: Message,
    ) -> Result<Delivery, MessageQueueError> {
        let Some(handler) = self.handlers.get(message.topic.as_str()) else {
            warn!(topic = %message.topic, "No subscription for queue; requeueing");
            queue.nack(&message.id).await?;
            return Ok(Delivery::Requeued);
        };

        let outcome = handler(message.payload.clone()).await;
        match outcome {
            Ok(()) => {
                queue.ack(&message.id).await?;
                counter!("dtbank_consumer.acked", 1, "queue" => message.topic.clone());
                Ok(Delivery::Acked)
            }
            Err(HandlerError::Decode(e)) => {
                error!(
                    topic = %message.topic,
                    message_id = %message.id,
                    error = %e,
                    "Discarding undecodable event"
                );
                queue.ack(&message.id).await?;
                counter!("dtbank_consumer.discarded", 1, "queue" => message.topic.clone());
                Ok(Delivery::Discarded)
            }
            Err(HandlerError::Failed(e)) => {
                warn!(
                    topic = %message.topic,
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    error = %e,
                    "Event handler failed; requeueing"
                );
                queue.nack(&message.id).await?;
                counter!("dtbank_consumer.requeued", 1, "queue" => message.topic.clone());
                Ok(Delivery::Requeued)
            }
        }
    }

    /// Takes at most one message off `topic` and delivers it.
    pub async fn consume_once(
        &self,
        queue: &dyn MessageQueue,
        topic: &str,
    ) -> Result<Option<Delivery>, MessageQueueError> {
        match queue.subscribe(topic).await? {
            Some(message) => {
                let span = tracing::info_span!("consume", topic, message_id = %message.id);
                self.deliver(queue, message).instrument(span).await.map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Starts one polling loop per registered queue. Each loop drains its
/// queue, then sleeps `poll_interval`, until `shutdown` flips to true.
/// A requeued message also waits out `poll_interval` before the retry.
pub fn spawn_consumers(
    subscriptions: Subscriptions,
    queue: Arc<dyn MessageQueue>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let subscriptions = Arc::new(subscriptions);
    subscriptions
        .queues()
        .into_iter()
        .map(|topic| {
            let subscriptions = subscriptions.clone();
            let queue = queue.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(topic, "Consumer started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match subscriptions.consume_once(queue.as_ref(), topic).await {
                        Ok(Some(Delivery::Requeued)) | Ok(None) => {}
                        Ok(Some(_)) => continue,
                        Err(e) => error!(topic, error = %e, "Consumer poll failed"),
                    }
                    tokio::select! {
                        _ = sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                info!(topic, "Consumer stopped");
            })
        })
        .collect()
}
