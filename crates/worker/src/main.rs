use std::{sync::Arc, time::Duration};

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::{DBService, DbErr, events::EventEnvelope};
use services::services::{
    bus::InProcessMessageBus,
    consumer::{EventHandler, IdempotencyGuard, spawn_consumer},
    delivery::{DeliveryConfig, DeliveryQueue, DeliveryScheduler, PublisherWorker},
    invitations::InvitationService,
    outbox::OutboxWriter,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, prelude::*};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const EXPIRY_SWEEP_BATCH: u64 = 200;
const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LEDGER_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const TOPIC_ENV: &str = "GREENROOM_EVENT_TOPIC";
const POLL_SECS_ENV: &str = "GREENROOM_OUTBOX_POLL_SECS";
const MAX_RETRIES_ENV: &str = "GREENROOM_PUBLISH_MAX_RETRIES";
const CONCURRENCY_ENV: &str = "GREENROOM_PUBLISH_CONCURRENCY";

#[derive(Debug, Error)]
pub enum GreenroomWorkerError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

/// Built-in consumer that mirrors every published event into the log. It
/// doubles as the worked example for real downstream handlers: subscribe,
/// run behind the idempotency guard, stay harmless on redelivery.
struct AuditLogHandler;

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn service_name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %envelope.event_id,
            event_type = envelope.event_type.as_str(),
            source = envelope.source.as_str(),
            "invitation event"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), GreenroomWorkerError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,worker={level},services={level},db={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let db = DBService::new().await?;
    let config = Arc::new(delivery_config());
    tracing::info!(
        topic = config.topic.as_str(),
        concurrency = config.concurrency,
        max_retries = config.max_retries,
        "Starting invitation event pipeline"
    );

    let bus = Arc::new(InProcessMessageBus::new());
    let queue = DeliveryQueue::new(config.queue_capacity);
    let writer = OutboxWriter::new(config.source.clone(), queue.clone());
    let invitations = InvitationService::new(db.clone(), writer);

    DeliveryScheduler::new(db.clone(), queue.clone(), config.clone()).spawn();
    PublisherWorker::new(db.clone(), bus.clone(), queue.clone(), config.clone()).spawn_pool();
    invitations.spawn_expiry_sweep(EXPIRY_SWEEP_INTERVAL, EXPIRY_SWEEP_BATCH);

    spawn_consumer(db.clone(), &bus, &config.topic, Arc::new(AuditLogHandler));
    IdempotencyGuard::new(db, "audit-log").spawn_pruner(LEDGER_PRUNE_INTERVAL, LEDGER_RETENTION);

    let (shutdown_rx, force_exit_rx) = spawn_shutdown_watchers();
    wait_for_watch_true(shutdown_rx).await;
    tracing::info!("Shutdown signal received, draining in-flight deliveries");

    tokio::select! {
        _ = drain_queue(&queue) => {
            tracing::info!("Delivery queue drained, exiting");
        }
        _ = wait_for_watch_true(force_exit_rx) => {
            tracing::warn!("Force shutdown requested (second signal), exiting immediately");
            std::process::exit(130);
        }
        _ = tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT) => {
            tracing::warn!(
                "Graceful shutdown timed out after {:?}, exiting immediately",
                GRACEFUL_SHUTDOWN_TIMEOUT
            );
        }
    }

    Ok(())
}

fn delivery_config() -> DeliveryConfig {
    let mut config = DeliveryConfig::default();
    if let Ok(topic) = std::env::var(TOPIC_ENV)
        && !topic.trim().is_empty()
    {
        config.topic = topic.trim().to_string();
    }
    if let Some(secs) = read_env_u64(POLL_SECS_ENV) {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(retries) = read_env_u64(MAX_RETRIES_ENV) {
        config.max_retries = retries as i32;
    }
    if let Some(workers) = read_env_u64(CONCURRENCY_ENV) {
        config.concurrency = workers as usize;
    }
    config
}

fn read_env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        tracing::warn!("{name} is set but empty; using default");
        return None;
    }
    match trimmed.parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        Ok(_) => {
            tracing::warn!("{name} must be positive; using default");
            None
        }
        Err(err) => {
            tracing::warn!(value = trimmed, error = %err, "Invalid {name}; using default");
            None
        }
    }
}

async fn drain_queue(queue: &DeliveryQueue) {
    while queue.depth() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn spawn_shutdown_watchers() -> (watch::Receiver<bool>, watch::Receiver<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (force_exit_tx, force_exit_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut shutdown_sent = false;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::error!("Failed to install SIGINT handler: {e}");
                    return;
                }
            };

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {e}");
                    None
                }
            };

            loop {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = async {
                        if let Some(sigterm) = sigterm.as_mut() {
                            sigterm.recv().await;
                        } else {
                            std::future::pending::<()>().await;
                        }
                    } => {},
                }

                if !shutdown_sent {
                    shutdown_sent = true;
                    tracing::info!(
                        "Shutdown signal received, starting graceful shutdown (press Ctrl+C again to force)"
                    );
                    let _ = shutdown_tx.send(true);
                } else {
                    tracing::warn!("Second shutdown signal received, forcing exit");
                    let _ = force_exit_tx.send(true);
                    break;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {e}");
                return;
            }

            tracing::info!(
                "Shutdown signal received, starting graceful shutdown (press Ctrl+C again to force)"
            );
            let _ = shutdown_tx.send(true);

            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {e}");
                return;
            }

            tracing::warn!("Second shutdown signal received, forcing exit");
            let _ = force_exit_tx.send(true);
        }
    });

    (shutdown_rx, force_exit_rx)
}

async fn wait_for_watch_true(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }

        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
