pub mod broker;
pub mod queue;
pub mod rabbitmq;
pub mod runtime;

pub use broker::{QueueBroker, QueueDelivery, QueueError, QueueSubscription};
pub use queue::{AckMode, ConsumeOutcome, DeliveryHandler, HandlerError, QueueClient};
pub use rabbitmq::LapinBroker;
