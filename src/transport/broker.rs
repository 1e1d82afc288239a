#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// AMQP delivery mode asking the broker to persist the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The broker connection or channel failed; callers reconnect.
    #[error("broker connection error: {0}")]
    Connection(String),
    /// A single publish attempt failed after the connection was established.
    #[error("publish to `{queue}` failed: {reason}")]
    Publish { queue: String, reason: String },
    /// The caller stopped waiting for a retrying publish.
    #[error("publish to `{queue}` abandoned after {waited:?}")]
    Abandoned { queue: String, waited: Duration },
    /// Shutdown was requested while a publish was still retrying.
    #[error("publish to `{queue}` cancelled by shutdown after {attempts} attempt(s)")]
    Cancelled { queue: String, attempts: u32 },
    #[error("failed to encode message for `{queue}`: {reason}")]
    Encode { queue: String, reason: String },
}

impl QueueError {
    pub fn connection(reason: impl Into<String>) -> Self {
        QueueError::Connection(reason.into())
    }

    pub fn publish(queue: &str, reason: impl Into<String>) -> Self {
        QueueError::Publish {
            queue: queue.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
}

/// One broker endpoint: single-attempt publishes and fresh subscriptions.
#[async_trait]
pub trait QueueBroker: Send + Sync + 'static {
    /// Declares `queue` durable and publishes `body` with persistent delivery.
    async fn publish_once(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Declares `queue` durable and starts consuming it.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn QueueSubscription>, QueueError>;
}

#[async_trait]
pub trait QueueSubscription: Send {
    /// `Ok(None)` means the broker closed the consumer stream.
    async fn next_delivery(&mut self) -> Result<Option<QueueDelivery>, QueueError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    /// Releases the connection behind the subscription once consuming stops.
    async fn close(&mut self);
}

pub fn encode_message<M>(queue: &str, message: &M) -> Result<Vec<u8>, QueueError>
where
    M: Serialize + ?Sized,
{
    serde_json::to_vec(message).map_err(|err| QueueError::Encode {
        queue: queue.to_string(),
        reason: err.to_string(),
    })
}

pub async fn publish_with_metrics<F, Fut, T>(
    queue: &str,
    publish: F,
) -> Result<T, QueueError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let start = Instant::now();
    let result = publish().await;
    match result.as_ref() {
        Ok(_) => record_publish_metrics(queue, "success", start.elapsed()),
        Err(_) => record_publish_metrics(queue, "error", start.elapsed()),
    }
    result
}

fn record_publish_metrics(queue: &str, status: &'static str, elapsed: Duration) {
    metrics::counter!(
        "deferhook_broker_publish_total",
        "queue" => queue.to_owned(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "deferhook_broker_publish_elapsed_ms",
        "queue" => queue.to_owned(),
        "status" => status
    )
    .record(elapsed.as_secs_f64() * 1000.0);
}
