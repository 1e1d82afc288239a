use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::sync::OnceLock;

pub use crate::telemetry::RuntimeCountersSnapshot;

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn inc_timers_persisted(&self) {
        self.counters.inc_timers_persisted();
    }

    pub fn inc_store_retry(&self) {
        self.counters.inc_store_retries();
    }

    pub fn inc_message_rejected(&self) {
        self.counters.inc_messages_rejected();
    }

    pub fn inc_fire_published(&self) {
        self.counters.inc_fire_published();
    }

    pub fn inc_fire_publish_abandoned(&self) {
        self.counters.inc_fire_publish_abandoned();
    }

    pub fn inc_publish_retry(&self) {
        self.counters.inc_publish_retries();
    }

    pub fn inc_timer_completed(&self) {
        self.counters.inc_timers_completed();
    }

    pub fn inc_hook_fired(&self) {
        self.counters.inc_hooks_fired();
    }

    pub fn inc_hook_failed(&self) {
        self.counters.inc_hooks_failed();
    }

    pub fn inc_reconnect(&self) {
        self.counters.inc_reconnects();
    }
}

pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
