use crate::entities::outbox_event::{self, Entity as OutboxEvent, OutboxStatus};
use crate::errors::ServiceError;
use crate::events::{binding_for_queue, DeletionEvent};
use crate::message_queue::{Message, MessageQueue};
use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BATCH_SIZE: u64 = 50;
const BASE_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 300;

/// Writes `event` to the outbox. Call with the transaction that performs
/// the delete so the event exists if and only if the delete commits.
pub async fn enqueue<E: DeletionEvent>(
    db: &impl ConnectionTrait,
    event: &E,
) -> Result<Uuid, ServiceError> {
    let now = Utc::now();
    let id = Uuid::new_v4();
    let payload = serde_json::to_string(event)?;

    outbox_event::ActiveModel {
        id: Set(id),
        aggregate_type: Set(E::AGGREGATE_TYPE.to_string()),
        aggregate_id: Set(event.aggregate_id()),
        event_type: Set(E::EVENT_TYPE.to_string()),
        queue: Set(E::BINDING.queue.to_string()),
        payload: Set(payload),
        status: Set(OutboxStatus::Pending),
        attempts: Set(0),
        available_at: Set(now),
        processed_at: Set(None),
        error_message: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .map_err(ServiceError::db_error)?;

    debug!(
        "enqueued outbox event {} type={} agg={}",
        id,
        E::EVENT_TYPE,
        event.aggregate_id()
    );
    Ok(id)
}

/// Relays committed outbox rows to the message queue.
#[derive(Clone)]
pub struct OutboxRelay {
    db: DatabaseConnection,
    queue: Arc<dyn MessageQueue>,
}

impl OutboxRelay {
    pub fn new(db: DatabaseConnection, queue: Arc<dyn MessageQueue>) -> Self {
        Self { db, queue }
    }

    /// Returns rows stranded in `processing` by a previous run to `pending`.
    pub async fn recover(&self) -> Result<u64, ServiceError> {
        let result = OutboxEvent::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Pending.to_value()),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Processing))
            .exec(&self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected > 0 {
            warn!("requeued {} outbox events left in processing", result.rows_affected);
        }
        Ok(result.rows_affected)
    }

    /// Publishes one batch of due rows. Returns how many were delivered.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let due = OutboxEvent::find()
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
            .filter(outbox_event::Column::AvailableAt.lte(now))
            .order_by_asc(outbox_event::Column::CreatedAt)
            .limit(BATCH_SIZE)
            .all(&self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut delivered = 0;
        for row in due {
            if !self.claim(&row).await? {
                continue;
            }
            let attempts = row.attempts + 1;
            match self.publish(&row).await {
                Ok(()) => {
                    self.mark_delivered(row.id).await?;
                    delivered += 1;
                }
                Err(PublishError::Undeliverable(reason)) => {
                    error!("outbox event {} cannot be delivered: {}", row.id, reason);
                    self.mark_failed(row.id, &reason).await?;
                }
                Err(PublishError::Retry(reason)) => {
                    warn!(
                        "publishing outbox event {} failed (attempt {}): {}",
                        row.id, attempts, reason
                    );
                    self.schedule_retry(row.id, attempts, &reason).await?;
                }
            }
        }
        Ok(delivered)
    }

    /// Flips a row from pending to processing; false if another relay won.
    async fn claim(&self, row: &outbox_event::Model) -> Result<bool, ServiceError> {
        let result = OutboxEvent::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Processing.to_value()),
            )
            .col_expr(
                outbox_event::Column::Attempts,
                Expr::col(outbox_event::Column::Attempts).add(1),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(outbox_event::Column::Id.eq(row.id))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
            .exec(&self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected == 1)
    }

    async fn publish(&self, row: &outbox_event::Model) -> Result<(), PublishError> {
        let binding = binding_for_queue(&row.queue)
            .ok_or_else(|| PublishError::Undeliverable(format!("unknown queue {}", row.queue)))?;
        let payload: Value = serde_json::from_str(&row.payload)
            .map_err(|e| PublishError::Undeliverable(e.to_string()))?;

        let mut message = Message::new(binding.queue, binding.routing_key, payload);
        // Reuse the row id so redelivered publishes are recognisable downstream.
        message.id = row.id;

        self.queue
            .publish(message)
            .await
            .map_err(|e| PublishError::Retry(e.to_string()))?;
        counter!("dtbank_outbox.published", 1, "queue" => binding.queue);
        Ok(())
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        OutboxEvent::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Delivered.to_value()),
            )
            .col_expr(outbox_event::Column::ProcessedAt, Expr::value(Some(now)))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                outbox_event::Column::ErrorMessage,
                Expr::value(Option::<String>::None),
            )
            .filter(outbox_event::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), ServiceError> {
        counter!("dtbank_outbox.failed", 1);
        OutboxEvent::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Failed.to_value()),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(
                outbox_event::Column::ErrorMessage,
                Expr::value(Some(reason.to_string())),
            )
            .filter(outbox_event::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn schedule_retry(&self, id: Uuid, attempts: i32, reason: &str) -> Result<(), ServiceError> {
        counter!("dtbank_outbox.retried", 1);
        let now = Utc::now();
        let available_at = now + retry_delay(attempts, now.timestamp_millis() as u64);
        OutboxEvent::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Pending.to_value()),
            )
            .col_expr(outbox_event::Column::AvailableAt, Expr::value(available_at))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                outbox_event::Column::ErrorMessage,
                Expr::value(Some(reason.to_string())),
            )
            .filter(outbox_event::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }
}

enum PublishError {
    /// The broker refused; try again later.
    Retry(String),
    /// The row itself is broken; retrying cannot help.
    Undeliverable(String),
}

/// Exponential backoff capped at five minutes, plus up to a second of jitter.
fn retry_delay(attempts: i32, seed_ms: u64) -> chrono::Duration {
    let exp = u32::try_from(attempts.max(1)).unwrap_or(1).min(16);
    let secs = BASE_BACKOFF_SECS.saturating_pow(exp).min(MAX_BACKOFF_SECS);
    let jitter_ms = seed_ms % 1000;
    chrono::Duration::milliseconds((secs * 1000 + jitter_ms) as i64)
}

/// Background worker polling the outbox until `shutdown` flips to true.
pub fn start_worker(
    relay: OutboxRelay,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = relay.recover().await {
            error!("outbox recovery failed: {}", e);
        }
        info!("Outbox relay started");
        loop {
            if let Err(e) = relay.drain_once().await {
                error!("outbox worker error: {}", e);
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Outbox relay stopped");
    })
}
