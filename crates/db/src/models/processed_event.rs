use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter, Set,
    sea_query::OnConflict,
};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::processed_event;

#[derive(Debug, Error)]
pub enum ProcessedEventError {
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Per-consumer ledger of handled event ids. Publishing is at-least-once, so
/// every consumer checks here before running its handler and records the id
/// after. Scoped by `service_name`: one consumer handling an event must not
/// stop a different consumer from handling it.
pub struct ProcessedEvent;

impl ProcessedEvent {
    pub async fn seen<C: ConnectionTrait>(
        db: &C,
        event_id: Uuid,
        service_name: &str,
    ) -> Result<bool, ProcessedEventError> {
        let count = processed_event::Entity::find()
            .filter(processed_event::Column::EventId.eq(event_id))
            .filter(processed_event::Column::ServiceName.eq(service_name))
            .count(db)
            .await?;
        Ok(count > 0)
    }

    /// Records the event as handled. Returns false when a concurrent
    /// delivery of the same event already wrote the row.
    pub async fn mark_processed<C: ConnectionTrait>(
        db: &C,
        event_id: Uuid,
        event_type: &str,
        service_name: &str,
        payload_hash: &str,
    ) -> Result<bool, ProcessedEventError> {
        let inserted = processed_event::Entity::insert(processed_event::ActiveModel {
            event_id: Set(event_id),
            event_type: Set(event_type.to_string()),
            service_name: Set(service_name.to_string()),
            payload_hash: Set(payload_hash.to_string()),
            processed_at: Set(Utc::now()),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::columns([
                processed_event::Column::EventId,
                processed_event::Column::ServiceName,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
        Ok(inserted == 1)
    }

    /// Drops ledger rows older than `processed_before`. Redeliveries arrive
    /// within hours, not months, so old rows only cost space.
    pub async fn prune<C: ConnectionTrait>(
        db: &C,
        processed_before: DateTime<Utc>,
    ) -> Result<u64, ProcessedEventError> {
        let deleted = processed_event::Entity::delete_many()
            .filter(processed_event::Column::ProcessedAt.lt(processed_before))
            .exec(db)
            .await?;
        Ok(deleted.rows_affected)
    }
}
