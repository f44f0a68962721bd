//! Worker pool and scheduler
//!
//! A fixed set of queue consumers drains the outbox; a scheduler drives the
//! periodic sweeps. Shutdown is cooperative through a watch channel: the
//! HTTP listener closes first, workers drain in-flight jobs, then the pools
//! close. A hard-exit watchdog fires at 45 seconds.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use hustle_core::CoreResult;

use crate::{
    metrics::CoreMetrics,
    outbox::{queues, OutboxClient, OutboxEvent},
    recovery::RecoveryService,
};

const CLAIM_BATCH: i64 = 25;
const CLAIM_TIMEOUT_SECS: i64 = 120;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const JOB_DEADLINE: Duration = Duration::from_secs(30);

/// Hard ceiling on graceful shutdown before the watchdog exits the process.
pub const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(45);

/// Handles jobs claimed from one named queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> &'static str;
    async fn handle(&self, event: &OutboxEvent) -> CoreResult<()>;
}

/// Default publication handler: emits the envelope as a structured log line
/// for downstream collectors. External consumers read the envelopes; the
/// core's contract ends at durable, exactly-once authored publication.
pub struct PublishHandler {
    queue: &'static str,
}

impl PublishHandler {
    pub fn new(queue: &'static str) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler for PublishHandler {
    fn queue(&self) -> &'static str {
        self.queue
    }

    async fn handle(&self, event: &OutboxEvent) -> CoreResult<()> {
        info!(
            queue = self.queue,
            event_type = %event.event_type,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            payload = %event.payload,
            "event published"
        );
        Ok(())
    }
}

/// Shutdown signal shared by every long-running task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The queue consumer set plus the periodic scheduler.
pub struct WorkerPool {
    pool: PgPool,
    outbox: OutboxClient,
    metrics: Arc<CoreMetrics>,
    recovery: Arc<RecoveryService>,
}

impl WorkerPool {
    pub fn new(
        pool: PgPool,
        outbox: OutboxClient,
        metrics: Arc<CoreMetrics>,
        recovery: Arc<RecoveryService>,
    ) -> Self {
        Self {
            pool,
            outbox,
            metrics,
            recovery,
        }
    }

    /// Spawn every consumer and sweep loop. Handles drain on shutdown.
    pub fn spawn(&self, shutdown: Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for queue in [
            queues::CRITICAL_PAYMENTS,
            queues::USER_NOTIFICATIONS,
            queues::FRAUD_DETECTION,
        ] {
            let handler: Arc<dyn JobHandler> = Arc::new(PublishHandler::new(queue));
            handles.push(self.spawn_consumer(handler, shutdown.clone()));
        }

        handles.push(self.spawn_sweep(
            "minutely",
            Duration::from_secs(60),
            shutdown.clone(),
            SweepKind::Minutely,
        ));
        handles.push(self.spawn_sweep(
            "fraud",
            Duration::from_secs(300),
            shutdown.clone(),
            SweepKind::Fraud,
        ));
        handles.push(self.spawn_sweep(
            "attribution",
            Duration::from_secs(1800),
            shutdown.clone(),
            SweepKind::HalfHourly,
        ));
        handles.push(self.spawn_sweep(
            "daily",
            Duration::from_secs(86_400),
            shutdown,
            SweepKind::Daily,
        ));

        handles
    }

    fn spawn_consumer(&self, handler: Arc<dyn JobHandler>, shutdown: Shutdown) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let outbox = self.outbox.clone();
        let metrics = self.metrics.clone();
        let mut shutdown = shutdown;

        tokio::spawn(async move {
            let queue = handler.queue();
            info!(queue, "worker started");
            loop {
                if shutdown.is_requested() {
                    break;
                }

                let batch = match outbox
                    .claim_batch(&pool, queue, CLAIM_BATCH, CLAIM_TIMEOUT_SECS)
                    .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        error!(queue, error = %err, "claim failed");
                        tokio::time::sleep(POLL_INTERVAL).await;
                        continue;
                    }
                };

                if batch.is_empty() {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {},
                        _ = shutdown.wait() => break,
                    }
                    continue;
                }

                for event in batch {
                    let timer = metrics
                        .worker_latency
                        .with_label_values(&[queue])
                        .start_timer();
                    // Jobs carry a deadline; an overrun surrenders the claim
                    // so another worker (or the reclaimer) takes over.
                    let result = tokio::time::timeout(JOB_DEADLINE, handler.handle(&event)).await;
                    timer.observe_duration();

                    match result {
                        Ok(Ok(())) => {
                            if let Err(err) = outbox.mark_published(&pool, event.id).await {
                                error!(queue, error = %err, "publish mark failed");
                            }
                        }
                        Ok(Err(err)) => {
                            warn!(queue, event_id = %event.id, error = %err, "job failed");
                            outbox.mark_failed(&pool, &event, &err.to_string()).await.ok();
                        }
                        Err(_) => {
                            warn!(queue, event_id = %event.id, "job deadline exceeded");
                            outbox
                                .mark_failed(&pool, &event, "job deadline exceeded")
                                .await
                                .ok();
                        }
                    }
                }
            }
            info!(queue, "worker drained");
        })
    }

    fn spawn_sweep(
        &self,
        name: &'static str,
        period: Duration,
        shutdown: Shutdown,
        kind: SweepKind,
    ) -> JoinHandle<()> {
        let recovery = self.recovery.clone();
        let mut shutdown = shutdown;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = shutdown.wait() => break,
                }
                if let Err(err) = run_sweep(&recovery, kind).await {
                    error!(sweep = name, error = %err, "sweep failed");
                }
            }
            info!(sweep = name, "sweep stopped");
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum SweepKind {
    Minutely,
    Fraud,
    HalfHourly,
    Daily,
}

async fn run_sweep(recovery: &RecoveryService, kind: SweepKind) -> CoreResult<()> {
    match kind {
        SweepKind::Minutely => recovery.minutely().await,
        SweepKind::Fraud => recovery.fraud_scan().await,
        SweepKind::HalfHourly => recovery.half_hourly().await,
        SweepKind::Daily => recovery.daily_cleanup().await,
    }
}

/// Arm the hard-exit watchdog; call right after a shutdown is requested.
pub fn arm_shutdown_watchdog() -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_WATCHDOG).await;
        error!("graceful shutdown exceeded watchdog; exiting hard");
        std::process::exit(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_propagates() {
        let (tx, shutdown) = Shutdown::new();
        assert!(!shutdown.is_requested());

        let mut waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            true
        });

        tx.send(true).unwrap();
        assert!(handle.await.unwrap());
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn publish_handler_succeeds() {
        let handler = PublishHandler::new(queues::USER_NOTIFICATIONS);
        let event = OutboxEvent {
            id: uuid::Uuid::new_v4(),
            aggregate_type: "task".into(),
            aggregate_id: uuid::Uuid::new_v4(),
            event_type: "task.created".into(),
            payload: serde_json::json!({}),
            queue_name: queues::USER_NOTIFICATIONS.into(),
            attempts: 0,
            created_at: chrono::Utc::now(),
        };
        assert!(handler.handle(&event).await.is_ok());
    }
}
