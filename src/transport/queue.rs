#![forbid(unsafe_code)]

use crate::metrics::metrics;
use crate::retry::{with_retry, RetryPolicy, Sleeper};
use crate::transport::broker::{
    encode_message, publish_with_metrics, QueueBroker, QueueDelivery, QueueError,
    QueueSubscription,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// When a consumed message is acknowledged relative to its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// Ack as soon as the message arrives, before the handler runs.
    OnReceipt,
    /// Ack only after the handler returns `Ok`.
    AfterHandle,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload can never be processed; it is rejected without requeue.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Shutdown interrupted the handler; the message goes back on the queue.
    #[error("handler interrupted: {0}")]
    Interrupted(String),
}

/// Per-message callback driven by [`QueueClient::consume`].
///
/// Deliveries are handed over strictly one at a time; the next message is not
/// pulled until `handle` has returned and the acknowledgement has been sent.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    fn ack_mode(&self) -> AckMode;

    async fn handle(
        &self,
        delivery: &QueueDelivery,
        shutdown: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// How a `consume` call ended. There is no "success": consumption only stops
/// because of shutdown or a broken connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Cancelled,
    ConnectionLost(QueueError),
}

pub struct QueueClient<B> {
    broker: B,
    publish_policy: RetryPolicy,
    prefetch: u16,
    sleeper: Arc<dyn Sleeper>,
}

impl<B> QueueClient<B>
where
    B: QueueBroker,
{
    pub fn new(broker: B, publish_policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            broker,
            publish_policy,
            prefetch: 1,
            sleeper,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// Publishes `message` as JSON, retrying failed attempts on the publish
    /// backoff policy until one succeeds.
    ///
    /// The client never gives up by itself. Callers that need to stop waiting
    /// either cancel `shutdown` or drop the future (e.g. behind a timeout).
    pub async fn publish<M>(
        &self,
        queue: &str,
        message: &M,
        shutdown: &CancellationToken,
    ) -> Result<(), QueueError>
    where
        M: Serialize + ?Sized,
    {
        let body = encode_message(queue, message)?;
        let broker = &self.broker;
        let body = body.as_slice();

        with_retry(
            &self.publish_policy,
            self.sleeper.as_ref(),
            shutdown,
            |err: &QueueError, attempt, delay| {
                metrics().inc_publish_retry();
                tracing::warn!(
                    target: "deferhook::queue",
                    event = "publish_retry",
                    queue = %queue,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err
                );
            },
            move || publish_with_metrics(queue, move || broker.publish_once(queue, body)),
        )
        .await
        .map_err(|cancelled| QueueError::Cancelled {
            queue: queue.to_string(),
            attempts: cancelled.attempts,
        })
    }

    /// Subscribes to `queue` and feeds every delivery to `handler` until the
    /// connection breaks or `shutdown` fires.
    pub async fn consume<H>(
        &self,
        queue: &str,
        handler: &H,
        shutdown: &CancellationToken,
    ) -> ConsumeOutcome
    where
        H: DeliveryHandler + ?Sized,
    {
        if shutdown.is_cancelled() {
            return ConsumeOutcome::Cancelled;
        }

        let mut subscription = match self.broker.subscribe(queue, self.prefetch).await {
            Ok(subscription) => subscription,
            Err(err) => return ConsumeOutcome::ConnectionLost(err),
        };

        tracing::info!(
            target: "deferhook::queue",
            event = "consume_started",
            queue = %queue
        );

        let outcome = deliver(subscription.as_mut(), queue, handler, shutdown).await;
        subscription.close().await;
        outcome
    }
}

async fn deliver<H>(
    subscription: &mut dyn QueueSubscription,
    queue: &str,
    handler: &H,
    shutdown: &CancellationToken,
) -> ConsumeOutcome
where
    H: DeliveryHandler + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return ConsumeOutcome::Cancelled,
            next = subscription.next_delivery() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                return ConsumeOutcome::ConnectionLost(QueueError::connection(format!(
                    "consumer stream for `{queue}` ended"
                )))
            }
            Err(err) => return ConsumeOutcome::ConnectionLost(err),
        };

        if let Err(err) = dispatch(&mut *subscription, queue, handler, &delivery, shutdown).await {
            return ConsumeOutcome::ConnectionLost(err);
        }
    }
}

async fn dispatch<H>(
    subscription: &mut dyn QueueSubscription,
    queue: &str,
    handler: &H,
    delivery: &QueueDelivery,
    shutdown: &CancellationToken,
) -> Result<(), QueueError>
where
    H: DeliveryHandler + ?Sized,
{
    let tag = delivery.delivery_tag;
    tracing::debug!(
        target: "deferhook::queue",
        event = "delivery_received",
        queue = %queue,
        routing_key = %delivery.routing_key,
        delivery_tag = tag,
        redelivered = delivery.redelivered
    );

    match handler.ack_mode() {
        AckMode::OnReceipt => {
            subscription.ack(tag).await?;
            if let Err(err) = handler.handle(delivery, shutdown).await {
                tracing::error!(
                    target: "deferhook::queue",
                    event = "handler_failed",
                    queue = %queue,
                    delivery_tag = tag,
                    error = %err
                );
            }
        }
        AckMode::AfterHandle => match handler.handle(delivery, shutdown).await {
            Ok(()) => subscription.ack(tag).await?,
            Err(HandlerError::Malformed(reason)) => {
                tracing::error!(
                    target: "deferhook::queue",
                    event = "message_rejected",
                    queue = %queue,
                    delivery_tag = tag,
                    reason = %reason
                );
                subscription.nack(tag, false).await?;
            }
            Err(HandlerError::Interrupted(reason)) => {
                tracing::warn!(
                    target: "deferhook::queue",
                    event = "message_requeued",
                    queue = %queue,
                    delivery_tag = tag,
                    reason = %reason
                );
                subscription.nack(tag, true).await?;
            }
        },
    }

    Ok(())
}
