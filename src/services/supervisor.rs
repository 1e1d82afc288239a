use crate::hook_event;
use crate::metrics::metrics;
use crate::transport::broker::QueueBroker;
use crate::transport::queue::{ConsumeOutcome, DeliveryHandler, QueueClient};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Keeps `handler` subscribed to `queue` until shutdown.
///
/// A lost connection is logged, then the loop waits `reconnect_interval` and
/// subscribes again from scratch. Returns how many reconnects happened.
pub async fn supervise<B, H>(
    service: &'static str,
    client: &QueueClient<B>,
    queue: &str,
    handler: &H,
    reconnect_interval: Duration,
    shutdown: &CancellationToken,
) -> u32
where
    B: QueueBroker,
    H: DeliveryHandler + ?Sized,
{
    let mut reconnects: u32 = 0;

    loop {
        match client.consume(queue, handler, shutdown).await {
            ConsumeOutcome::Cancelled => {
                log_stopped(service, queue, reconnects);
                return reconnects;
            }
            ConsumeOutcome::ConnectionLost(err) => {
                hook_event!(
                    warn,
                    "deferhook::supervisor",
                    "connection_lost",
                    service = service,
                    queue = queue,
                    error = err,
                    retry_in_ms = reconnect_interval.as_millis()
                );
                if client.sleeper().sleep(reconnect_interval, shutdown).await {
                    log_stopped(service, queue, reconnects);
                    return reconnects;
                }
                reconnects = reconnects.saturating_add(1);
                metrics().inc_reconnect();
            }
        }
    }
}

fn log_stopped(service: &'static str, queue: &str, reconnects: u32) {
    hook_event!(
        info,
        "deferhook::supervisor",
        "consumer_stopped",
        service = service,
        queue = queue,
        reconnects = reconnects,
        counters = metrics().snapshot()
    );
}
