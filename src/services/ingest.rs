//! Ingestion Consumer: records newly created timers in the store.
//!
//! Each message on the incoming queue is decoded and persisted as a timer plus
//! its ready-to-fire row. A failed store batch is retried whole on the fixed
//! store policy; the message stays unacknowledged until the batch commits.

use crate::domain::{CreateTimerMessage, Timer};
use crate::metrics::metrics;
use crate::retry::{with_retry, RetryPolicy, Sleeper};
use crate::services::supervisor::supervise;
use crate::store::{StatementRunner, StoreError, TimerRepository};
use crate::transport::broker::{QueueBroker, QueueDelivery};
use crate::transport::queue::{AckMode, DeliveryHandler, HandlerError, QueueClient};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SERVICE: &str = "consumer";

pub struct IngestHandler<R> {
    repository: TimerRepository<R>,
    store_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<R> IngestHandler<R>
where
    R: StatementRunner,
{
    pub fn new(
        repository: TimerRepository<R>,
        store_policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            repository,
            store_policy,
            sleeper,
        }
    }

    fn decode(delivery: &QueueDelivery) -> Result<Timer, HandlerError> {
        let message: CreateTimerMessage = serde_json::from_slice(&delivery.body)
            .map_err(|err| HandlerError::Malformed(err.to_string()))?;
        Timer::try_from(message).map_err(|err| HandlerError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl<R> DeliveryHandler for IngestHandler<R>
where
    R: StatementRunner,
{
    fn ack_mode(&self) -> AckMode {
        AckMode::AfterHandle
    }

    async fn handle(
        &self,
        delivery: &QueueDelivery,
        shutdown: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let timer = match Self::decode(delivery) {
            Ok(timer) => timer,
            Err(err) => {
                metrics().inc_message_rejected();
                return Err(err);
            }
        };

        let repository = &self.repository;
        let pending = &timer;
        with_retry(
            &self.store_policy,
            self.sleeper.as_ref(),
            shutdown,
            |err: &StoreError, attempt, delay| {
                metrics().inc_store_retry();
                tracing::warn!(
                    target: "deferhook::ingest",
                    event = "persist_retry",
                    timer_id = %pending.id,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err
                );
            },
            move || repository.persist(pending),
        )
        .await
        .map_err(|cancelled| HandlerError::Interrupted(cancelled.to_string()))?;

        metrics().inc_timers_persisted();
        tracing::info!(
            target: "deferhook::ingest",
            event = "timer_persisted",
            timer_id = %timer.id,
            fire_at = %timer.fire_at,
            url = %timer.url
        );
        Ok(())
    }
}

/// Runs [`IngestHandler`] against the incoming queue under the reconnect
/// supervisor.
pub struct IngestionConsumer<B, R> {
    client: QueueClient<B>,
    handler: IngestHandler<R>,
    queue: String,
    reconnect_interval: Duration,
}

impl<B, R> IngestionConsumer<B, R>
where
    B: QueueBroker,
    R: StatementRunner,
{
    pub fn new(
        client: QueueClient<B>,
        handler: IngestHandler<R>,
        queue: impl Into<String>,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            client,
            handler,
            queue: queue.into(),
            reconnect_interval,
        }
    }

    pub async fn run(&self, shutdown: &CancellationToken) {
        crate::hook_event!(
            info,
            "deferhook::ingest",
            "consumer_started",
            service = SERVICE,
            queue = self.queue
        );
        supervise(
            SERVICE,
            &self.client,
            &self.queue,
            &self.handler,
            self.reconnect_interval,
            shutdown,
        )
        .await;
    }
}
