use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
    sea_query::{Expr, ExprTrait},
};
use thiserror::Error;
use uuid::Uuid;

use crate::{entities::event_outbox, events::EventEnvelope, types::OutboxStatus};

#[derive(Debug, Error)]
pub enum EventOutboxError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error("outbox row for event {0} not found")]
    NotFound(Uuid),
}

/// Transactional outbox rows. Events are recorded on the same connection (or
/// transaction) as the state change that raised them, then walked through
/// `pending -> publishing -> published`, with `failed` holding rows between
/// retries and, past the retry budget, parking them for operators. All
/// status transitions are keyed by `event_id`, the one identifier shared
/// with delivery jobs and consumers.
pub struct EventOutbox;

impl EventOutbox {
    /// Inserts a `pending` row holding the whole wire envelope, so every
    /// redelivery ships byte-identical content under the same `event_id`.
    pub async fn record<C: ConnectionTrait>(
        db: &C,
        aggregate_id: Uuid,
        envelope: &EventEnvelope,
    ) -> Result<event_outbox::Model, EventOutboxError> {
        let now = Utc::now();
        let row = event_outbox::ActiveModel {
            event_id: Set(envelope.event_id),
            aggregate_id: Set(aggregate_id),
            event_type: Set(envelope.event_type.clone()),
            payload: Set(serde_json::to_value(envelope)?),
            status: Set(OutboxStatus::Pending),
            retry_count: Set(0),
            error_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            published_at: Set(None),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Ok(row)
    }

    /// Pending rows in insertion order, oldest first. Rows created before
    /// `fresh_since` are left where they are: something already went wrong
    /// with those and redelivering them unprompted helps nobody.
    pub async fn find_pending_batch<C: ConnectionTrait>(
        db: &C,
        fresh_since: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<event_outbox::Model>, EventOutboxError> {
        let rows = event_outbox::Entity::find()
            .filter(event_outbox::Column::Status.eq(OutboxStatus::Pending))
            .filter(event_outbox::Column::CreatedAt.gt(fresh_since))
            .order_by_asc(event_outbox::Column::CreatedAt)
            .order_by_asc(event_outbox::Column::Id)
            .limit(limit)
            .all(db)
            .await?;
        Ok(rows)
    }

    /// Flips the `pending` row for this event to `publishing` and returns
    /// it. Returns `None` when there is no pending row, which means another
    /// worker won the claim or the row was already published.
    pub async fn claim<C: ConnectionTrait>(
        db: &C,
        event_id: Uuid,
    ) -> Result<Option<event_outbox::Model>, EventOutboxError> {
        let claimed = event_outbox::Entity::update_many()
            .col_expr(
                event_outbox::Column::Status,
                Expr::value(OutboxStatus::Publishing),
            )
            .col_expr(event_outbox::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(event_outbox::Column::EventId.eq(event_id))
            .filter(event_outbox::Column::Status.eq(OutboxStatus::Pending))
            .exec(db)
            .await?;
        if claimed.rows_affected == 0 {
            return Ok(None);
        }
        let row = event_outbox::Entity::find()
            .filter(event_outbox::Column::EventId.eq(event_id))
            .one(db)
            .await?
            .ok_or(EventOutboxError::NotFound(event_id))?;
        Ok(Some(row))
    }

    pub async fn mark_published<C: ConnectionTrait>(
        db: &C,
        event_id: Uuid,
    ) -> Result<(), EventOutboxError> {
        let now = Utc::now();
        let updated = event_outbox::Entity::update_many()
            .col_expr(
                event_outbox::Column::Status,
                Expr::value(OutboxStatus::Published),
            )
            .col_expr(event_outbox::Column::PublishedAt, Expr::value(Some(now)))
            .col_expr(event_outbox::Column::UpdatedAt, Expr::value(now))
            .filter(event_outbox::Column::EventId.eq(event_id))
            .exec(db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(EventOutboxError::NotFound(event_id));
        }
        Ok(())
    }

    /// Moves the row to `failed`, stores the broker error and bumps the
    /// retry counter. Returns the new count so the caller can decide between
    /// releasing the row for another attempt and leaving it parked.
    pub async fn record_failure<C: ConnectionTrait>(
        db: &C,
        event_id: Uuid,
        error: &str,
    ) -> Result<i32, EventOutboxError> {
        let row = event_outbox::Entity::find()
            .filter(event_outbox::Column::EventId.eq(event_id))
            .one(db)
            .await?
            .ok_or(EventOutboxError::NotFound(event_id))?;
        let retries = row.retry_count + 1;
        let mut active: event_outbox::ActiveModel = row.into();
        active.status = Set(OutboxStatus::Failed);
        active.retry_count = Set(retries);
        active.error_message = Set(Some(error.to_string()));
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(retries)
    }

    /// Puts a `failed` row back in the pending queue, keeping its retry
    /// count. Returns false when the row is not failed, which means someone
    /// else already moved it.
    pub async fn release_for_retry<C: ConnectionTrait>(
        db: &C,
        event_id: Uuid,
    ) -> Result<bool, EventOutboxError> {
        let released = event_outbox::Entity::update_many()
            .col_expr(
                event_outbox::Column::Status,
                Expr::value(OutboxStatus::Pending),
            )
            .col_expr(event_outbox::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(event_outbox::Column::EventId.eq(event_id))
            .filter(event_outbox::Column::Status.eq(OutboxStatus::Failed))
            .exec(db)
            .await?;
        Ok(released.rows_affected == 1)
    }

    /// Re-offers `publishing` rows whose claim went quiet before
    /// `abandoned_before`, which happens when a worker dies mid-publish. The
    /// abandoned attempt is counted against the row's retry budget.
    pub async fn release_stuck<C: ConnectionTrait>(
        db: &C,
        abandoned_before: DateTime<Utc>,
    ) -> Result<u64, EventOutboxError> {
        let released = event_outbox::Entity::update_many()
            .col_expr(
                event_outbox::Column::Status,
                Expr::value(OutboxStatus::Pending),
            )
            .col_expr(
                event_outbox::Column::RetryCount,
                Expr::col(event_outbox::Column::RetryCount).add(1),
            )
            .col_expr(event_outbox::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(event_outbox::Column::Status.eq(OutboxStatus::Publishing))
            .filter(event_outbox::Column::UpdatedAt.lt(abandoned_before))
            .exec(db)
            .await?;
        Ok(released.rows_affected)
    }

    /// Deletes `published` rows older than `published_before`. `failed` rows
    /// are never pruned.
    pub async fn prune_published<C: ConnectionTrait>(
        db: &C,
        published_before: DateTime<Utc>,
    ) -> Result<u64, EventOutboxError> {
        let deleted = event_outbox::Entity::delete_many()
            .filter(event_outbox::Column::Status.eq(OutboxStatus::Published))
            .filter(event_outbox::Column::PublishedAt.lt(published_before))
            .exec(db)
            .await?;
        Ok(deleted.rows_affected)
    }
}
