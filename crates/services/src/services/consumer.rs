use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use db::{
    DBService,
    events::EventEnvelope,
    models::processed_event::{ProcessedEvent, ProcessedEventError},
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;

use crate::services::bus::InProcessMessageBus;

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Ledger(#[from] ProcessedEventError),
    #[error("event handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

/// Hex SHA-256 of the envelope payload, stored with the ledger row so a
/// suspicious redelivery can be diffed after the fact.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let digest = Sha256::digest(payload.to_string().as_bytes());
    format!("{digest:x}")
}

/// Consumer-side duplicate filter. Publishing is at-least-once, so every
/// handler runs behind this guard: check the ledger, run the handler, then
/// record the event id. The ledger write is not atomic with the handler;
/// a crash between the two redelivers the event, which is exactly the
/// at-least-once contract handlers already sign up for.
#[derive(Clone)]
pub struct IdempotencyGuard {
    db: DBService,
    service_name: String,
}

impl IdempotencyGuard {
    pub fn new(db: DBService, service_name: impl Into<String>) -> Self {
        Self {
            db,
            service_name: service_name.into(),
        }
    }

    pub async fn is_processed(&self, event_id: Uuid) -> Result<bool, ConsumeError> {
        Ok(ProcessedEvent::seen(&self.db.pool, event_id, &self.service_name).await?)
    }

    pub async fn mark_processed(&self, envelope: &EventEnvelope) -> Result<bool, ConsumeError> {
        Ok(ProcessedEvent::mark_processed(
            &self.db.pool,
            envelope.event_id,
            &envelope.event_type,
            &self.service_name,
            &payload_hash(&envelope.payload),
        )
        .await?)
    }

    /// Runs `handler` unless this consumer already processed the event.
    /// Returns true when the handler ran. Handler errors propagate before
    /// anything is marked, so the event stays eligible for redelivery.
    pub async fn process_safely<F>(
        &self,
        envelope: &EventEnvelope,
        handler: F,
    ) -> Result<bool, ConsumeError>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        if self.is_processed(envelope.event_id).await? {
            tracing::debug!(
                event_id = %envelope.event_id,
                service = self.service_name.as_str(),
                "duplicate delivery skipped"
            );
            return Ok(false);
        }

        handler.await.map_err(ConsumeError::Handler)?;

        if !self.mark_processed(envelope).await? {
            tracing::warn!(
                event_id = %envelope.event_id,
                service = self.service_name.as_str(),
                "concurrent delivery processed the same event"
            );
        }
        Ok(true)
    }

    /// Ledger retention. Redeliveries arrive within hours, so rows older
    /// than `retention` only cost space.
    pub fn spawn_pruner(&self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            loop {
                let before = Utc::now()
                    - chrono::Duration::from_std(retention)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                match ProcessedEvent::prune(&guard.db.pool, before).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::debug!(pruned, "pruned processed event ledger"),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to prune processed event ledger")
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

/// A downstream consumer of invitation events. `service_name` scopes the
/// idempotency ledger; two handlers with the same name share one ledger
/// and must be interchangeable.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn service_name(&self) -> &str;
    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Subscribes `handler` to a topic behind the idempotency guard.
pub fn spawn_consumer(
    db: DBService,
    bus: &InProcessMessageBus,
    topic: &str,
    handler: Arc<dyn EventHandler>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe(topic);
    let guard = IdempotencyGuard::new(db, handler.service_name().to_string());
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let outcome = guard
                        .process_safely(&envelope, handler.handle(&envelope))
                        .await;
                    if let Err(err) = outcome {
                        tracing::error!(
                            event_id = %envelope.event_id,
                            event_type = envelope.event_type.as_str(),
                            error = %err,
                            "event handler failed"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "consumer lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;
    use serde_json::json;

    use super::*;
    use crate::services::bus::MessageBus;

    async fn setup_db() -> DBService {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&pool, None).await.unwrap();
        DBService { pool }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(
            "invitation.created",
            "greenroom-interviews",
            json!({"invitationId": Uuid::new_v4()}),
        )
    }

    struct CountingHandler {
        name: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn service_name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_runs_once_per_event() {
        let db = setup_db().await;
        let guard = IdempotencyGuard::new(db, "scoring");
        let envelope = envelope();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            guard
                .process_safely(&envelope, async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_run_reports_true_duplicates_false() {
        let db = setup_db().await;
        let guard = IdempotencyGuard::new(db, "scoring");
        let envelope = envelope();

        assert!(guard.process_safely(&envelope, async { Ok(()) }).await.unwrap());
        assert!(!guard.process_safely(&envelope, async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn failed_handlers_leave_the_event_unmarked() {
        let db = setup_db().await;
        let guard = IdempotencyGuard::new(db, "scoring");
        let envelope = envelope();

        let err = guard
            .process_safely(&envelope, async { anyhow::bail!("downstream offline") })
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Handler(_)));
        assert!(!guard.is_processed(envelope.event_id).await.unwrap());

        // The redelivery gets a clean run.
        assert!(guard.process_safely(&envelope, async { Ok(()) }).await.unwrap());
        assert!(guard.is_processed(envelope.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn consumers_are_scoped_by_service_name() {
        let db = setup_db().await;
        let scoring = IdempotencyGuard::new(db.clone(), "scoring");
        let notifications = IdempotencyGuard::new(db, "notifications");
        let envelope = envelope();

        assert!(scoring.process_safely(&envelope, async { Ok(()) }).await.unwrap());
        assert!(
            notifications
                .process_safely(&envelope, async { Ok(()) })
                .await
                .unwrap()
        );
        assert!(!scoring.process_safely(&envelope, async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn subscribed_handler_absorbs_redeliveries() {
        let db = setup_db().await;
        let bus = InProcessMessageBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            name: "audit".to_string(),
            calls: calls.clone(),
        });
        spawn_consumer(db, &bus, "invitation-events", handler);

        // The same envelope delivered twice, as after a worker crash.
        let envelope = envelope();
        bus.publish("invitation-events", "key", &envelope).await.unwrap();
        bus.publish("invitation-events", "key", &envelope).await.unwrap();

        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Give the duplicate a chance to be (wrongly) processed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn payload_hash_is_stable_per_content() {
        let payload = json!({"invitationId": "a", "answered": 1});
        assert_eq!(payload_hash(&payload), payload_hash(&payload.clone()));
        assert_ne!(
            payload_hash(&payload),
            payload_hash(&json!({"invitationId": "a", "answered": 2}))
        );
    }
}
