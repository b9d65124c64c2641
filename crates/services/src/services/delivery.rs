use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::{
    DBService,
    events::EventEnvelope,
    models::event_outbox::{EventOutbox, EventOutboxError},
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::services::bus::{BusError, MessageBus};

/// Tuning for the outbox delivery pipeline. The worker binary fills this
/// from the environment; tests poke fields directly.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub topic: String,
    pub source: String,
    pub poll_interval: Duration,
    pub batch_limit: u64,
    /// Pending rows older than this are left for operators instead of
    /// being re-offered by the sweep.
    pub pending_staleness: Duration,
    pub stuck_sweep_interval: Duration,
    /// How long a `publishing` claim may sit untouched before it counts
    /// as abandoned.
    pub stuck_threshold: Duration,
    pub cleanup_interval: Duration,
    pub published_retention: Duration,
    pub max_retries: i32,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub retry_base_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            topic: "invitation-events".to_string(),
            source: "greenroom-interviews".to_string(),
            poll_interval: Duration::from_secs(2),
            batch_limit: 100,
            pending_staleness: Duration::from_secs(60 * 60),
            stuck_sweep_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(60 * 60),
            published_retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_retries: 5,
            concurrency: 4,
            queue_capacity: 512,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

fn cutoff(window: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero())
}

/// In-memory queue of delivery jobs, one job per outbox `event_id`.
/// Offering an id that is already queued or being delivered is a no-op, so
/// the enqueue-on-commit path and the periodic sweep can both offer the
/// same row without double delivery. A full channel drops the offer; the
/// row stays `pending` and the next sweep picks it up.
#[derive(Clone)]
pub struct DeliveryQueue {
    jobs: Arc<DashMap<Uuid, ()>>,
    tx: mpsc::Sender<Uuid>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            jobs: Arc::new(DashMap::new()),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Returns true when a new job was queued.
    pub fn offer(&self, event_id: Uuid) -> bool {
        if self.jobs.insert(event_id, ()).is_some() {
            return false;
        }
        if self.tx.try_send(event_id).is_err() {
            self.jobs.remove(&event_id);
            tracing::warn!(event_id = %event_id, "delivery queue full; row waits for the next sweep");
            return false;
        }
        true
    }

    pub async fn next(&self) -> Option<Uuid> {
        self.rx.lock().await.recv().await
    }

    /// Releases the id for future offers. Workers call this after the job
    /// finished, in any outcome.
    pub fn finish(&self, event_id: Uuid) {
        self.jobs.remove(&event_id);
    }

    pub fn depth(&self) -> usize {
        self.jobs.len()
    }
}

/// Drives the periodic outbox duties. Each duty runs on its own ticker
/// task with a single consumer, so a slow pass delays only the next pass
/// of the same duty and two passes never overlap.
#[derive(Clone)]
pub struct DeliveryScheduler {
    db: DBService,
    queue: DeliveryQueue,
    config: Arc<DeliveryConfig>,
}

impl DeliveryScheduler {
    pub fn new(db: DBService, queue: DeliveryQueue, config: Arc<DeliveryConfig>) -> Self {
        Self { db, queue, config }
    }

    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_pending_sweep(),
            self.spawn_stuck_recovery(),
            self.spawn_retention_cleanup(),
        ]
    }

    fn spawn_pending_sweep(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                match scheduler.sweep_pending().await {
                    Ok(0) => {}
                    Ok(offered) => tracing::debug!(offered, "queued pending outbox rows"),
                    Err(err) => tracing::error!(error = %err, "outbox sweep failed"),
                }
                tokio::time::sleep(scheduler.config.poll_interval).await;
            }
        })
    }

    fn spawn_stuck_recovery(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                match scheduler.recover_stuck().await {
                    Ok(0) => {}
                    Ok(released) => {
                        tracing::warn!(released, "re-queued outbox rows abandoned mid-publish")
                    }
                    Err(err) => tracing::error!(error = %err, "stuck claim recovery failed"),
                }
                tokio::time::sleep(scheduler.config.stuck_sweep_interval).await;
            }
        })
    }

    fn spawn_retention_cleanup(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                match scheduler.cleanup_published().await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::debug!(pruned, "pruned published outbox rows"),
                    Err(err) => tracing::error!(error = %err, "outbox retention cleanup failed"),
                }
                tokio::time::sleep(scheduler.config.cleanup_interval).await;
            }
        })
    }

    /// One pass of the pending sweep: offers a delivery job per fresh
    /// pending row, oldest first. This is the safety net behind the
    /// enqueue-on-commit fast path; in steady state most offers are
    /// duplicates and come back false.
    pub async fn sweep_pending(&self) -> Result<usize, EventOutboxError> {
        let rows = EventOutbox::find_pending_batch(
            &self.db.pool,
            cutoff(self.config.pending_staleness),
            self.config.batch_limit,
        )
        .await?;
        let mut offered = 0;
        for row in rows {
            if self.queue.offer(row.event_id) {
                offered += 1;
            }
        }
        Ok(offered)
    }

    pub async fn recover_stuck(&self) -> Result<u64, EventOutboxError> {
        EventOutbox::release_stuck(&self.db.pool, cutoff(self.config.stuck_threshold)).await
    }

    pub async fn cleanup_published(&self) -> Result<u64, EventOutboxError> {
        EventOutbox::prune_published(&self.db.pool, cutoff(self.config.published_retention)).await
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Outbox(#[from] EventOutboxError),
    #[error("publish failed on attempt {attempt}: {source}")]
    PublishFailed {
        attempt: i32,
        #[source]
        source: BusError,
    },
    #[error("delivery parked after {retries} attempts")]
    Parked { retries: i32 },
    #[error("stored envelope is invalid: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
}

/// Publishes claimed outbox rows to the message bus. Safe to run many
/// copies in parallel: the pending-to-publishing claim is the exclusivity
/// guard, so two workers handed the same job cannot both publish it.
#[derive(Clone)]
pub struct PublisherWorker {
    db: DBService,
    bus: Arc<dyn MessageBus>,
    queue: DeliveryQueue,
    config: Arc<DeliveryConfig>,
}

impl PublisherWorker {
    pub fn new(
        db: DBService,
        bus: Arc<dyn MessageBus>,
        queue: DeliveryQueue,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        Self {
            db,
            bus,
            queue,
            config,
        }
    }

    pub fn spawn_pool(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|worker| {
                let publisher = self.clone();
                tokio::spawn(async move { publisher.run(worker).await })
            })
            .collect()
    }

    async fn run(&self, worker: usize) {
        while let Some(event_id) = self.queue.next().await {
            if let Err(err) = self.deliver(event_id).await {
                tracing::error!(worker, event_id = %event_id, error = %err, "delivery abandoned");
            }
            self.queue.finish(event_id);
        }
    }

    /// Runs one delivery job to completion, backing off between attempts
    /// until the row's persisted retry budget is spent. The budget lives on
    /// the row, not in this process, so attempts made by a worker that died
    /// still count.
    pub async fn deliver(&self, event_id: Uuid) -> Result<(), DeliveryError> {
        (|| self.attempt(event_id))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.config.retry_base_delay)
                    .with_max_times(self.config.max_retries as usize),
            )
            .when(|err| matches!(err, DeliveryError::PublishFailed { .. }))
            .notify(|err, delay| {
                tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "publish failed; backing off");
            })
            .await
    }

    async fn attempt(&self, event_id: Uuid) -> Result<(), DeliveryError> {
        // No pending row means another worker already handled the job.
        let Some(row) = EventOutbox::claim(&self.db.pool, event_id).await? else {
            return Ok(());
        };

        let envelope: EventEnvelope = match serde_json::from_value(row.payload.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Retrying cannot fix a corrupt row; park it for operators.
                EventOutbox::record_failure(
                    &self.db.pool,
                    event_id,
                    &format!("invalid envelope: {err}"),
                )
                .await?;
                return Err(DeliveryError::InvalidEnvelope(err));
            }
        };

        match self
            .bus
            .publish(&self.config.topic, &row.aggregate_id.to_string(), &envelope)
            .await
        {
            Ok(()) => {
                EventOutbox::mark_published(&self.db.pool, event_id).await?;
                tracing::debug!(event_id = %event_id, event_type = envelope.event_type.as_str(), "event published");
                Ok(())
            }
            Err(err) => {
                let retries =
                    EventOutbox::record_failure(&self.db.pool, event_id, &err.to_string()).await?;
                if retries < self.config.max_retries {
                    // Back in the pending queue before we re-raise, so the
                    // next attempt can claim it again.
                    EventOutbox::release_for_retry(&self.db.pool, event_id).await?;
                    Err(DeliveryError::PublishFailed {
                        attempt: retries,
                        source: err,
                    })
                } else {
                    Err(DeliveryError::Parked { retries })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use db::{entities::event_outbox, types::OutboxStatus};
    use sea_orm::{ActiveModelTrait, ColumnTrait, Database, EntityTrait, QueryFilter, Set};
    use sea_orm_migration::MigratorTrait;
    use serde_json::json;

    use super::*;
    use crate::services::bus::InProcessMessageBus;

    async fn setup_db() -> DBService {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&pool, None).await.unwrap();
        DBService { pool }
    }

    fn test_config() -> DeliveryConfig {
        DeliveryConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            ..DeliveryConfig::default()
        }
    }

    fn pipeline(
        db: &DBService,
        bus: Arc<dyn MessageBus>,
        config: DeliveryConfig,
    ) -> (DeliveryScheduler, PublisherWorker, DeliveryQueue) {
        let config = Arc::new(config);
        let queue = DeliveryQueue::new(config.queue_capacity);
        let scheduler = DeliveryScheduler::new(db.clone(), queue.clone(), config.clone());
        let worker = PublisherWorker::new(db.clone(), bus, queue.clone(), config);
        (scheduler, worker, queue)
    }

    async fn record_event(db: &DBService, aggregate_id: Uuid) -> event_outbox::Model {
        let envelope = EventEnvelope::new(
            "invitation.created",
            "greenroom-interviews",
            json!({"invitationId": aggregate_id}),
        );
        EventOutbox::record(&db.pool, aggregate_id, &envelope)
            .await
            .unwrap()
    }

    async fn fetch(db: &DBService, event_id: Uuid) -> event_outbox::Model {
        event_outbox::Entity::find()
            .filter(event_outbox::Column::EventId.eq(event_id))
            .one(&db.pool)
            .await
            .unwrap()
            .unwrap()
    }

    /// Fails the first `failures` publishes, then behaves like the real bus.
    struct FlakyBus {
        inner: InProcessMessageBus,
        failures_left: AtomicUsize,
    }

    impl FlakyBus {
        fn new(failures: usize) -> Self {
            Self {
                inner: InProcessMessageBus::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(
            &self,
            topic: &str,
            partition_key: &str,
            envelope: &EventEnvelope,
        ) -> Result<(), BusError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BusError::Unavailable("broker offline".to_string()));
            }
            self.inner.publish(topic, partition_key, envelope).await
        }
    }

    #[tokio::test]
    async fn queue_deduplicates_offers() {
        let queue = DeliveryQueue::new(16);
        let event_id = Uuid::new_v4();

        assert!(queue.offer(event_id));
        assert!(!queue.offer(event_id));
        assert_eq!(queue.depth(), 1);

        assert_eq!(queue.next().await, Some(event_id));
        // Still held until the worker reports back.
        assert!(!queue.offer(event_id));
        queue.finish(event_id);
        assert!(queue.offer(event_id));
    }

    #[tokio::test]
    async fn queue_overflow_drops_the_offer() {
        let queue = DeliveryQueue::new(1);

        assert!(queue.offer(Uuid::new_v4()));
        assert!(!queue.offer(Uuid::new_v4()));
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn sweep_offers_fresh_pending_rows_once() {
        let db = setup_db().await;
        let bus = Arc::new(InProcessMessageBus::new());
        let (scheduler, _, queue) = pipeline(&db, bus, test_config());

        let first = record_event(&db, Uuid::new_v4()).await;
        let second = record_event(&db, Uuid::new_v4()).await;

        assert_eq!(scheduler.sweep_pending().await.unwrap(), 2);
        // Jobs already queued; a second pass offers nothing new.
        assert_eq!(scheduler.sweep_pending().await.unwrap(), 0);

        assert_eq!(queue.next().await, Some(first.event_id));
        assert_eq!(queue.next().await, Some(second.event_id));
    }

    #[tokio::test]
    async fn deliver_publishes_and_retires_the_row() {
        let db = setup_db().await;
        let bus = Arc::new(InProcessMessageBus::new());
        let mut rx = bus.subscribe("invitation-events");
        let (_, worker, _) = pipeline(&db, bus, test_config());

        let row = record_event(&db, Uuid::new_v4()).await;
        worker.deliver(row.event_id).await.unwrap();

        let published = fetch(&db, row.event_id).await;
        assert_eq!(published.status, OutboxStatus::Published);
        assert!(published.published_at.is_some());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_id, row.event_id);

        // Redelivering a retired row is a quiet no-op.
        worker.deliver(row.event_id).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_budget() {
        let db = setup_db().await;
        let bus = Arc::new(FlakyBus::new(2));
        let mut rx = bus.inner.subscribe("invitation-events");
        let (_, worker, _) = pipeline(&db, bus.clone(), test_config());

        let row = record_event(&db, Uuid::new_v4()).await;
        worker.deliver(row.event_id).await.unwrap();

        let published = fetch(&db, row.event_id).await;
        assert_eq!(published.status, OutboxStatus::Published);
        assert_eq!(published.retry_count, 2);

        assert_eq!(rx.recv().await.unwrap().event_id, row.event_id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhausted_budget_parks_the_row_until_released() {
        let db = setup_db().await;
        let bus = Arc::new(FlakyBus::new(usize::MAX));
        let (_, worker, _) = pipeline(&db, bus, test_config());

        let row = record_event(&db, Uuid::new_v4()).await;
        let err = worker.deliver(row.event_id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Parked { retries: 3 }));

        let parked = fetch(&db, row.event_id).await;
        assert_eq!(parked.status, OutboxStatus::Failed);
        assert_eq!(parked.retry_count, 3);
        assert!(parked.error_message.as_deref().unwrap().contains("broker offline"));

        // Parked rows are invisible to both the sweep and a direct job.
        let healthy = Arc::new(InProcessMessageBus::new());
        let (scheduler, worker, _) = pipeline(&db, healthy.clone(), test_config());
        assert_eq!(scheduler.sweep_pending().await.unwrap(), 0);
        worker.deliver(row.event_id).await.unwrap();
        assert_eq!(fetch(&db, row.event_id).await.status, OutboxStatus::Failed);

        // An operator releases the row; the next sweep redelivers it under
        // the same event id.
        let mut rx = healthy.subscribe("invitation-events");
        assert!(
            EventOutbox::release_for_retry(&db.pool, row.event_id)
                .await
                .unwrap()
        );
        assert_eq!(scheduler.sweep_pending().await.unwrap(), 1);
        worker.deliver(row.event_id).await.unwrap();

        let redelivered = fetch(&db, row.event_id).await;
        assert_eq!(redelivered.status, OutboxStatus::Published);
        assert_eq!(redelivered.retry_count, 3);
        assert_eq!(rx.recv().await.unwrap().event_id, row.event_id);
    }

    #[tokio::test]
    async fn corrupt_payloads_park_without_retrying() {
        let db = setup_db().await;
        let bus = Arc::new(InProcessMessageBus::new());
        let (_, worker, _) = pipeline(&db, bus, test_config());

        let row = record_event(&db, Uuid::new_v4()).await;
        let mut active: event_outbox::ActiveModel = fetch(&db, row.event_id).await.into();
        active.payload = Set(json!("garbage"));
        active.update(&db.pool).await.unwrap();

        let err = worker.deliver(row.event_id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidEnvelope(_)));

        let parked = fetch(&db, row.event_id).await;
        assert_eq!(parked.status, OutboxStatus::Failed);
        assert_eq!(parked.retry_count, 1);
        assert!(parked.error_message.as_deref().unwrap().contains("invalid envelope"));
    }

    #[tokio::test]
    async fn abandoned_claims_are_recovered_and_redelivered() {
        let db = setup_db().await;
        let bus = Arc::new(InProcessMessageBus::new());
        let mut rx = bus.subscribe("invitation-events");
        let (scheduler, worker, queue) = pipeline(&db, bus, test_config());

        // A worker claims the row and dies before publishing.
        let row = record_event(&db, Uuid::new_v4()).await;
        EventOutbox::claim(&db.pool, row.event_id).await.unwrap().unwrap();
        let mut active: event_outbox::ActiveModel = fetch(&db, row.event_id).await.into();
        active.updated_at = Set(Utc::now() - chrono::Duration::minutes(10));
        active.update(&db.pool).await.unwrap();

        assert_eq!(scheduler.recover_stuck().await.unwrap(), 1);
        let recovered = fetch(&db, row.event_id).await;
        assert_eq!(recovered.status, OutboxStatus::Pending);
        assert_eq!(recovered.retry_count, 1);

        assert_eq!(scheduler.sweep_pending().await.unwrap(), 1);
        let event_id = queue.next().await.unwrap();
        worker.deliver(event_id).await.unwrap();

        assert_eq!(fetch(&db, row.event_id).await.status, OutboxStatus::Published);
        assert_eq!(rx.recv().await.unwrap().event_id, row.event_id);
    }

    #[tokio::test]
    async fn worker_pool_drains_offered_jobs() {
        let db = setup_db().await;
        let bus = Arc::new(InProcessMessageBus::new());
        let (scheduler, worker, _) = pipeline(&db, bus, test_config());

        let rows = [
            record_event(&db, Uuid::new_v4()).await,
            record_event(&db, Uuid::new_v4()).await,
            record_event(&db, Uuid::new_v4()).await,
        ];
        scheduler.sweep_pending().await.unwrap();
        worker.spawn_pool();

        for _ in 0..200 {
            let mut done = true;
            for row in &rows {
                done &= fetch(&db, row.event_id).await.status == OutboxStatus::Published;
            }
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("outbox rows were not delivered in time");
    }
}
