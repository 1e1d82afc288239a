//! Trigger Service: performs the outbound callback for each fire message.
//!
//! Messages are acknowledged on receipt, before the POST. A callback that
//! fails or answers non-2xx is logged and counted, never retried.

use crate::domain::{FireHookMessage, HookCallback};
use crate::hook_event;
use crate::metrics::metrics;
use crate::services::supervisor::supervise;
use crate::transport::broker::{QueueBroker, QueueDelivery};
use crate::transport::queue::{AckMode, DeliveryHandler, HandlerError, QueueClient};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const SERVICE: &str = "trigger";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("callback to `{url}` failed: {reason}")]
    Request { url: String, reason: String },
}

/// Outbound side of the callback; returns the HTTP status code.
#[async_trait]
pub trait HookSender: Send + Sync {
    async fn post(&self, url: &str, body: &HookCallback) -> Result<u16, TriggerError>;
}

pub struct ReqwestHookSender {
    client: reqwest::Client,
}

impl ReqwestHookSender {
    pub fn new(request_timeout: Duration) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| TriggerError::Client(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HookSender for ReqwestHookSender {
    async fn post(&self, url: &str, body: &HookCallback) -> Result<u16, TriggerError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| TriggerError::Request {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}

pub struct TriggerHandler<S> {
    sender: S,
}

impl<S> TriggerHandler<S>
where
    S: HookSender,
{
    pub fn new(sender: S) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S> DeliveryHandler for TriggerHandler<S>
where
    S: HookSender,
{
    fn ack_mode(&self) -> AckMode {
        AckMode::OnReceipt
    }

    async fn handle(
        &self,
        delivery: &QueueDelivery,
        _shutdown: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let message: FireHookMessage = serde_json::from_slice(&delivery.body).map_err(|err| {
            metrics().inc_message_rejected();
            HandlerError::Malformed(err.to_string())
        })?;

        match self.sender.post(&message.url, &message.callback()).await {
            Ok(status) if (200..300).contains(&status) => {
                metrics().inc_hook_fired();
                tracing::info!(
                    target: "deferhook::trigger",
                    event = "hook_fired",
                    timer_id = %message.id,
                    url = %message.url,
                    status = status
                );
            }
            Ok(status) => {
                metrics().inc_hook_failed();
                tracing::warn!(
                    target: "deferhook::trigger",
                    event = "hook_rejected",
                    timer_id = %message.id,
                    url = %message.url,
                    status = status
                );
            }
            Err(err) => {
                metrics().inc_hook_failed();
                tracing::warn!(
                    target: "deferhook::trigger",
                    event = "hook_failed",
                    timer_id = %message.id,
                    url = %message.url,
                    error = %err
                );
            }
        }
        Ok(())
    }
}

pub struct TriggerService<B, S> {
    client: QueueClient<B>,
    handler: TriggerHandler<S>,
    queue: String,
    reconnect_interval: Duration,
}

impl<B, S> TriggerService<B, S>
where
    B: QueueBroker,
    S: HookSender,
{
    pub fn new(
        client: QueueClient<B>,
        handler: TriggerHandler<S>,
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
        hook_event!(
            info,
            "deferhook::trigger",
            "trigger_started",
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
