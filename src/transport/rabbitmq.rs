#![forbid(unsafe_code)]

use crate::transport::broker::{
    QueueBroker, QueueDelivery, QueueError, QueueSubscription, PERSISTENT_DELIVERY_MODE,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio_executor_trait::Tokio as TokioExecutor;
use uuid::Uuid;

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// RabbitMQ broker reached through lapin.
///
/// Every publish opens and closes its own connection; subscriptions keep theirs
/// until the stream breaks, at which point the owning service resubscribes.
#[derive(Clone, Debug)]
pub struct LapinBroker {
    url: String,
    endpoint: String,
}

impl LapinBroker {
    /// `endpoint` is the credential-free address used in logs.
    pub fn new(url: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            endpoint: endpoint.into(),
        }
    }

    async fn open_channel(&self) -> Result<(Connection, Channel), QueueError> {
        tracing::info!(
            target: "deferhook::rabbitmq",
            event = "broker_connecting",
            endpoint = %self.endpoint
        );

        let properties = ConnectionProperties::default().with_executor(TokioExecutor::current());
        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|err| {
                QueueError::connection(format!("failed to connect to {}: {err}", self.endpoint))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::connection(format!("failed to open channel: {err}")))?;

        tracing::info!(
            target: "deferhook::rabbitmq",
            event = "broker_connected",
            endpoint = %self.endpoint
        );

        Ok((connection, channel))
    }

    async fn publish_on(
        &self,
        channel: &Channel,
        queue: &str,
        body: &[u8],
    ) -> Result<(), QueueError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                QueueError::connection(format!("failed to enable publisher confirms: {err}"))
            })?;

        declare_durable(channel, queue).await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type("application/json".into());

        let confirmation = channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|err| QueueError::connection(format!("basic_publish failed: {err}")))?
            .await
            .map_err(|err| QueueError::connection(format!("publisher confirm failed: {err}")))?;

        match confirmation {
            Confirmation::Nack(_) => Err(QueueError::publish(queue, "broker rejected message")),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl QueueBroker for LapinBroker {
    async fn publish_once(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let (connection, channel) = self.open_channel().await?;

        tracing::info!(
            target: "deferhook::rabbitmq",
            event = "publish_attempt",
            queue = %queue,
            bytes = body.len()
        );

        let result = self.publish_on(&channel, queue, body).await;
        close_connection(&connection, &self.endpoint).await;
        result
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn QueueSubscription>, QueueError> {
        let (connection, channel) = self.open_channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                QueueError::connection(format!(
                    "failed to configure prefetch (prefetch={prefetch}): {err}"
                ))
            })?;

        declare_durable(&channel, queue).await?;

        let consumer_tag = format!("deferhook-{queue}-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                QueueError::connection(format!("failed to start consumer on `{queue}`: {err}"))
            })?;

        tracing::info!(
            target: "deferhook::rabbitmq",
            event = "consumer_started",
            queue = %queue,
            consumer_tag = %consumer_tag
        );

        Ok(Box::new(LapinSubscription {
            connection,
            endpoint: self.endpoint.clone(),
            channel,
            consumer,
        }))
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), QueueError> {
    let options = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };
    channel
        .queue_declare(queue, options, FieldTable::default())
        .await
        .map(|_| ())
        .map_err(|err| QueueError::connection(format!("failed to declare queue `{queue}`: {err}")))
}

async fn close_connection(connection: &Connection, endpoint: &str) {
    match connection.close(CLOSE_REPLY_SUCCESS, "OK").await {
        Ok(()) => tracing::info!(
            target: "deferhook::rabbitmq",
            event = "broker_closed",
            endpoint = %endpoint
        ),
        Err(err) => tracing::debug!(
            target: "deferhook::rabbitmq",
            event = "broker_close_failed",
            endpoint = %endpoint,
            error = %err
        ),
    }
}

struct LapinSubscription {
    connection: Connection,
    endpoint: String,
    channel: Channel,
    consumer: Consumer,
}

impl LapinSubscription {
    fn convert_delivery(delivery: Delivery) -> QueueDelivery {
        QueueDelivery {
            body: delivery.data,
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
        }
    }
}

#[async_trait]
impl QueueSubscription for LapinSubscription {
    async fn next_delivery(&mut self) -> Result<Option<QueueDelivery>, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Self::convert_delivery(delivery))),
            Some(Err(err)) => Err(QueueError::connection(format!("consumer error: {err}"))),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| QueueError::connection(format!("ack failed: {err}")))
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };

        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|err| QueueError::connection(format!("nack failed: {err}")))
    }

    async fn close(&mut self) {
        close_connection(&self.connection, &self.endpoint).await;
    }
}
