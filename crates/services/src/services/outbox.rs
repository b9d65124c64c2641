use db::{
    ConnectionTrait, DBService,
    entities::event_outbox,
    events::{EventEnvelope, InvitationEvent},
    models::event_outbox::{EventOutbox, EventOutboxError},
};
use thiserror::Error;

use crate::services::delivery::DeliveryQueue;

#[derive(Debug, Error)]
pub enum OutboxWriteError {
    #[error(transparent)]
    Outbox(#[from] EventOutboxError),
    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writes domain events to the outbox. The wire envelope is built here,
/// once, and stored whole; whatever happens to delivery later, redeliveries
/// ship the same `event_id` and timestamp.
///
/// Two entry points with different contracts: [`OutboxWriter::record_in_tx`]
/// rides the caller's transaction and schedules nothing, while
/// [`OutboxWriter::record_standalone`] commits on the pool and offers the
/// delivery job itself.
#[derive(Clone)]
pub struct OutboxWriter {
    source: String,
    queue: DeliveryQueue,
}

impl OutboxWriter {
    pub fn new(source: impl Into<String>, queue: DeliveryQueue) -> Self {
        Self {
            source: source.into(),
            queue,
        }
    }

    /// Converts drained aggregate events into pending rows on `db`, which
    /// must be the transaction that persists the aggregate. Call
    /// [`OutboxWriter::schedule_publishing`] with the returned rows after
    /// that transaction commits; scheduling before commit would race the
    /// workers against a row they cannot see.
    pub async fn record_in_tx<C: ConnectionTrait>(
        &self,
        db: &C,
        events: &[InvitationEvent],
    ) -> Result<Vec<event_outbox::Model>, OutboxWriteError> {
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            let envelope =
                EventEnvelope::new(event.event_type(), &self.source, event.payload_json()?);
            rows.push(EventOutbox::record(db, event.aggregate_id(), &envelope).await?);
        }
        Ok(rows)
    }

    /// Records a single event outside any aggregate transaction and offers
    /// its delivery job immediately. The row is durable before the offer,
    /// so a dropped offer only delays delivery until the next sweep.
    pub async fn record_standalone(
        &self,
        db: &DBService,
        event: &InvitationEvent,
    ) -> Result<event_outbox::Model, OutboxWriteError> {
        let envelope = EventEnvelope::new(event.event_type(), &self.source, event.payload_json()?);
        let row = EventOutbox::record(&db.pool, event.aggregate_id(), &envelope).await?;
        self.schedule_publishing(std::slice::from_ref(&row));
        Ok(row)
    }

    /// Offers delivery jobs for committed rows. Duplicate and dropped
    /// offers are fine; the pending sweep re-offers anything missed.
    pub fn schedule_publishing(&self, rows: &[event_outbox::Model]) {
        for row in rows {
            self.queue.offer(row.event_id);
        }
    }
}
