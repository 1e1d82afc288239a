//! Structured events for the consumer, poller and trigger loops.

/// `hook_event!(info, target, "event", service = .., queue = .., extra = ..)`.
///
/// `queue` is optional. Extra fields are recorded with their `Display` form.
#[macro_export]
macro_rules! hook_event {
    ($level:ident, $target:expr, $event:expr, service = $service:expr, queue = $queue:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            service = $service,
            queue = %$queue,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, service = $service:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            service = $service,
            $($field = %$value,)*
        )
    };
}
