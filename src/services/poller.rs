//! Expiry Poller: moves due timers from the store onto the to-fire queue.
//!
//! A cycle scans `timers_to_fire` for rows at or before the current time,
//! publishes one fire message per row and deletes the row only once its
//! publish succeeded. A publish still retrying when the deadline passes is
//! abandoned for this cycle; the row stays and is picked up next time.

use crate::clock::Clock;
use crate::domain::ReadyToFire;
use crate::hook_event;
use crate::metrics::metrics;
use crate::retry::{with_retry, RetryCancelled, RetryPolicy, Sleeper};
use crate::store::{StatementRunner, StoreError, TimerRepository};
use crate::transport::broker::{QueueBroker, QueueError};
use crate::transport::queue::QueueClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SERVICE: &str = "poller";

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub to_fire_queue: String,
    pub interval: Duration,
    pub publish_deadline: Duration,
    pub store_policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub found: usize,
    pub published: usize,
    pub deleted: usize,
    pub skipped: usize,
}

pub struct ExpiryPoller<B, R> {
    client: QueueClient<B>,
    repository: TimerRepository<R>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    settings: PollerSettings,
}

impl<B, R> ExpiryPoller<B, R>
where
    B: QueueBroker,
    R: StatementRunner,
{
    pub fn new(
        client: QueueClient<B>,
        repository: TimerRepository<R>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            client,
            repository,
            clock,
            sleeper,
            settings,
        }
    }

    /// Polls until shutdown, sleeping `interval` between cycles.
    pub async fn run(&self, shutdown: &CancellationToken) {
        hook_event!(
            info,
            "deferhook::poller",
            "poller_started",
            service = SERVICE,
            queue = self.settings.to_fire_queue,
            interval_ms = self.settings.interval.as_millis()
        );

        while !shutdown.is_cancelled() {
            match self.poll_once(shutdown).await {
                Ok(report) if report.found > 0 => {
                    hook_event!(
                        info,
                        "deferhook::poller",
                        "cycle_complete",
                        service = SERVICE,
                        queue = self.settings.to_fire_queue,
                        found = report.found,
                        published = report.published,
                        deleted = report.deleted,
                        skipped = report.skipped
                    );
                }
                Ok(_) => {}
                Err(_) => break,
            }

            if self.sleeper.sleep(self.settings.interval, shutdown).await {
                break;
            }
        }

        hook_event!(
            info,
            "deferhook::poller",
            "poller_stopped",
            service = SERVICE,
            counters = metrics().snapshot()
        );
    }

    /// One Scan → Publish/Delete pass. Only shutdown during a store retry
    /// ends it early.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<CycleReport, RetryCancelled> {
        let due = self.scan(shutdown).await?;
        let mut report = CycleReport {
            found: due.len(),
            ..CycleReport::default()
        };

        for ready in &due {
            match self.publish_fire(ready, shutdown).await {
                Ok(()) => {
                    report.published += 1;
                    metrics().inc_fire_published();
                    self.remove(ready.id, shutdown).await?;
                    report.deleted += 1;
                    metrics().inc_timer_completed();
                    tracing::info!(
                        target: "deferhook::poller",
                        event = "timer_handed_off",
                        timer_id = %ready.id,
                        fire_at = %ready.fire_at
                    );
                }
                Err(err) => {
                    report.skipped += 1;
                    metrics().inc_fire_publish_abandoned();
                    tracing::warn!(
                        target: "deferhook::poller",
                        event = "fire_publish_skipped",
                        timer_id = %ready.id,
                        error = %err
                    );
                }
            }
        }

        Ok(report)
    }

    async fn scan(&self, shutdown: &CancellationToken) -> Result<Vec<ReadyToFire>, RetryCancelled> {
        let repository = &self.repository;
        let clock = self.clock.as_ref();
        with_retry(
            &self.settings.store_policy,
            self.sleeper.as_ref(),
            shutdown,
            |err: &StoreError, attempt, delay| {
                metrics().inc_store_retry();
                tracing::warn!(
                    target: "deferhook::poller",
                    event = "scan_retry",
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err
                );
            },
            move || repository.due(clock.now()),
        )
        .await
    }

    async fn publish_fire(
        &self,
        ready: &ReadyToFire,
        shutdown: &CancellationToken,
    ) -> Result<(), QueueError> {
        let queue = self.settings.to_fire_queue.as_str();
        let deadline = self.settings.publish_deadline;
        let message = ready.fire_message();

        match tokio::time::timeout(deadline, self.client.publish(queue, &message, shutdown)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Abandoned {
                queue: queue.to_string(),
                waited: deadline,
            }),
        }
    }

    async fn remove(&self, id: Uuid, shutdown: &CancellationToken) -> Result<(), RetryCancelled> {
        let repository = &self.repository;
        with_retry(
            &self.settings.store_policy,
            self.sleeper.as_ref(),
            shutdown,
            |err: &StoreError, attempt, delay| {
                metrics().inc_store_retry();
                tracing::warn!(
                    target: "deferhook::poller",
                    event = "delete_retry",
                    timer_id = %id,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err
                );
            },
            move || repository.remove(id),
        )
        .await
    }
}
