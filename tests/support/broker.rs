use async_trait::async_trait;
use deferhook::transport::{QueueBroker, QueueDelivery, QueueError, QueueSubscription};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    Ack(u64),
    Nack { tag: u64, requeue: bool },
}

#[derive(Clone, Debug)]
pub enum SubscriptionStep {
    Deliver(QueueDelivery),
    Fail(QueueError),
    End,
}

/// In-memory broker. Publishes are recorded per queue; each `subscribe` pops
/// the next scripted subscription. A subscription that runs out of steps
/// cancels the drain token (if set) and then waits forever.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    publish_failures: Option<u32>,
    publish_attempts: u32,
    published: Vec<(String, JsonValue)>,
    subscribe_failures: u32,
    subscribe_calls: u32,
    closed_subscriptions: u32,
    subscriptions: VecDeque<Vec<SubscriptionStep>>,
    events: Vec<BrokerEvent>,
    drained: Option<CancellationToken>,
    next_tag: u64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.inner.lock().expect("mock broker state")
    }

    /// Fail the next `count` publish attempts.
    pub fn fail_publishes(&self, count: u32) {
        self.state().publish_failures = Some(count);
    }

    /// Every publish attempt fails until further notice.
    pub fn reject_all_publishes(&self) {
        self.state().publish_failures = Some(u32::MAX);
    }

    pub fn fail_subscribes(&self, count: u32) {
        self.state().subscribe_failures = count;
    }

    pub fn cancel_when_drained(&self, token: CancellationToken) {
        self.state().drained = Some(token);
    }

    pub fn script(&self, steps: Vec<SubscriptionStep>) {
        self.state().subscriptions.push_back(steps);
    }

    /// Builds a delivery with a fresh tag.
    pub fn delivery(&self, queue: &str, body: &JsonValue) -> QueueDelivery {
        self.raw_delivery(queue, serde_json::to_vec(body).expect("encode body"))
    }

    pub fn raw_delivery(&self, queue: &str, body: Vec<u8>) -> QueueDelivery {
        let mut state = self.state();
        state.next_tag += 1;
        QueueDelivery {
            body,
            delivery_tag: state.next_tag,
            routing_key: queue.to_string(),
            redelivered: false,
        }
    }

    pub fn published(&self, queue: &str) -> Vec<JsonValue> {
        self.state()
            .published
            .iter()
            .filter(|(name, _)| name == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn publish_attempts(&self) -> u32 {
        self.state().publish_attempts
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state().subscribe_calls
    }

    pub fn closed_subscriptions(&self) -> u32 {
        self.state().closed_subscriptions
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state().events.clone()
    }

    pub fn is_acked(&self, tag: u64) -> bool {
        self.state().events.contains(&BrokerEvent::Ack(tag))
    }
}

#[async_trait]
impl QueueBroker for MockBroker {
    async fn publish_once(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let mut state = self.state();
        state.publish_attempts += 1;
        if let Some(remaining) = state.publish_failures {
            if remaining > 0 {
                state.publish_failures = Some(remaining - 1);
                return Err(QueueError::connection("connection refused"));
            }
        }
        let body = serde_json::from_slice(body).expect("published JSON");
        state.published.push((queue.to_string(), body));
        Ok(())
    }

    async fn subscribe(
        &self,
        _queue: &str,
        _prefetch: u16,
    ) -> Result<Box<dyn QueueSubscription>, QueueError> {
        let mut state = self.state();
        state.subscribe_calls += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(QueueError::connection("broker unreachable"));
        }
        let steps = state.subscriptions.pop_front().unwrap_or_default();
        Ok(Box::new(MockSubscription {
            broker: self.clone(),
            steps: steps.into(),
        }))
    }
}

struct MockSubscription {
    broker: MockBroker,
    steps: VecDeque<SubscriptionStep>,
}

#[async_trait]
impl QueueSubscription for MockSubscription {
    async fn next_delivery(&mut self) -> Result<Option<QueueDelivery>, QueueError> {
        match self.steps.pop_front() {
            Some(SubscriptionStep::Deliver(delivery)) => Ok(Some(delivery)),
            Some(SubscriptionStep::Fail(err)) => Err(err),
            Some(SubscriptionStep::End) => Ok(None),
            None => {
                let drained = self.broker.state().drained.clone();
                if let Some(token) = drained {
                    token.cancel();
                }
                std::future::pending().await
            }
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.broker.state().events.push(BrokerEvent::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        self.broker.state().events.push(BrokerEvent::Nack {
            tag: delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.broker.state().closed_subscriptions += 1;
    }
}
