//! Builds each service from [`DeferhookConfig`] and runs it until Ctrl-C or
//! SIGTERM.

use crate::clock::{Clock, SystemClock};
use crate::config::DeferhookConfig;
use crate::domain::{Timer, TimerDuration};
use crate::error::{Context, Result};
use crate::retry::{Sleeper, TokioSleeper};
use crate::services::{
    ExpiryPoller, IngestHandler, IngestionConsumer, PollerSettings, ReqwestHookSender,
    TriggerHandler, TriggerService,
};
use crate::store::{PgStatementRunner, TimerRepository};
use crate::transport::queue::QueueClient;
use crate::transport::rabbitmq::LapinBroker;
use crate::transport::runtime::shutdown_signal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn sleeper() -> Arc<dyn Sleeper> {
    Arc::new(TokioSleeper)
}

fn queue_client(config: &DeferhookConfig) -> QueueClient<LapinBroker> {
    let broker = LapinBroker::new(config.broker.amqp_url(), config.broker.endpoint());
    QueueClient::new(broker, config.retry.policy(), sleeper()).with_prefetch(config.broker.prefetch)
}

fn repository(config: &DeferhookConfig) -> TimerRepository<PgStatementRunner> {
    TimerRepository::new(PgStatementRunner::new(
        config.store.connect_options(),
        config.store.endpoint(),
        config.store.connect_timeout(),
    ))
    .with_dedupe_inserts(config.store.dedupe_inserts)
}

/// Token cancelled once the process is asked to stop.
fn shutdown_on_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!(
            target: "deferhook::app",
            event = "shutdown_requested",
            "shutdown signal received"
        );
        trigger.cancel();
    });
    shutdown
}

pub async fn run_consumer(config: &DeferhookConfig) -> Result<()> {
    let handler = IngestHandler::new(repository(config), config.store.retry_policy(), sleeper());
    let consumer = IngestionConsumer::new(
        queue_client(config),
        handler,
        config.broker.incoming_queue.clone(),
        config.broker.reconnect_interval(),
    );
    consumer.run(&shutdown_on_signal()).await;
    Ok(())
}

pub async fn run_poller(config: &DeferhookConfig) -> Result<()> {
    let settings = PollerSettings {
        to_fire_queue: config.broker.to_fire_queue.clone(),
        interval: config.poller.interval(),
        publish_deadline: config.poller.publish_deadline(),
        store_policy: config.store.retry_policy(),
    };
    let poller = ExpiryPoller::new(
        queue_client(config),
        repository(config),
        Arc::new(SystemClock),
        sleeper(),
        settings,
    );
    poller.run(&shutdown_on_signal()).await;
    Ok(())
}

pub async fn run_trigger(config: &DeferhookConfig) -> Result<()> {
    let sender = ReqwestHookSender::new(config.trigger.request_timeout())
        .context("failed to build callback client")?;
    let service = TriggerService::new(
        queue_client(config),
        TriggerHandler::new(sender),
        config.broker.to_fire_queue.clone(),
        config.broker.reconnect_interval(),
    );
    service.run(&shutdown_on_signal()).await;
    Ok(())
}

/// Publishes a create-timer message to the incoming queue, as the HTTP front
/// door would.
pub async fn schedule(config: &DeferhookConfig, duration: TimerDuration, url: &str) -> Result<Timer> {
    let timer = Timer::schedule(duration, url, SystemClock.now())?;
    queue_client(config)
        .publish(
            &config.broker.incoming_queue,
            &timer.to_message(),
            &shutdown_on_signal(),
        )
        .await
        .with_context(|| format!("failed to publish timer {}", timer.id))?;
    Ok(timer)
}

pub async fn status(config: &DeferhookConfig, id: Uuid) -> Result<Option<Timer>> {
    let timer = repository(config)
        .find(id)
        .await
        .with_context(|| format!("failed to look up timer {id}"))?;
    Ok(timer)
}
