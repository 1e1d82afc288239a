use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "deferhook=info,info";

/// Installs the key=value line subscriber. `service` names the running process
/// (`consumer`, `poller`, `trigger`, ...) and is stamped on every line.
pub fn init_tracing(service: &'static str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new(service))
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    const fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let pid = std::process::id().to_string();
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());

        // `target:` overrides in the macros land here; fall back to the module path.
        let component = visitor
            .target
            .take()
            .unwrap_or_else(|| metadata.target().to_string());

        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", &component);
        push_field(&mut line, "pid", &pid);

        if let Some(span_path) = current_span_path(ctx) {
            push_field(&mut line, "span", &span_path);
        }

        push_field(&mut line, "msg", &message);

        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

fn current_span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let span = ctx.lookup_current()?;
    let names: Vec<&str> = span.scope().from_root().map(|s| s.name()).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join("."))
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    target: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            "target" => self.target = Some(value),
            name => self.fields.push((name.to_string(), value)),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

fn push_field(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');
    if needs_quoting(value) {
        line.push('"');
        for ch in value.chars() {
            match ch {
                '"' => line.push_str("\\\""),
                '\\' => line.push_str("\\\\"),
                '\n' => line.push_str("\\n"),
                other => line.push(other),
            }
        }
        line.push('"');
    } else {
        line.push_str(value);
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|ch| ch.is_whitespace() || ch == '"' || ch == '=' || ch == '\\')
}

#[derive(Default)]
pub struct RuntimeCounters {
    timers_persisted: AtomicU64,
    store_retries: AtomicU64,
    messages_rejected: AtomicU64,
    fire_published: AtomicU64,
    fire_publish_abandoned: AtomicU64,
    publish_retries: AtomicU64,
    timers_completed: AtomicU64,
    hooks_fired: AtomicU64,
    hooks_failed: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub timers_persisted: u64,
    pub store_retries: u64,
    pub messages_rejected: u64,
    pub fire_published: u64,
    pub fire_publish_abandoned: u64,
    pub publish_retries: u64,
    pub timers_completed: u64,
    pub hooks_fired: u64,
    pub hooks_failed: u64,
    pub reconnects: u64,
}

impl stdfmt::Display for RuntimeCountersSnapshot {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        write!(
            f,
            "timers_persisted={} store_retries={} messages_rejected={} fire_published={} \
             fire_publish_abandoned={} publish_retries={} timers_completed={} hooks_fired={} \
             hooks_failed={} reconnects={}",
            self.timers_persisted,
            self.store_retries,
            self.messages_rejected,
            self.fire_published,
            self.fire_publish_abandoned,
            self.publish_retries,
            self.timers_completed,
            self.hooks_fired,
            self.hooks_failed,
            self.reconnects
        )
    }
}

impl RuntimeCounters {
    pub fn inc_timers_persisted(&self) {
        self.timers_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_store_retries(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fire_published(&self) {
        self.fire_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fire_publish_abandoned(&self) {
        self.fire_publish_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_publish_retries(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timers_completed(&self) {
        self.timers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hooks_fired(&self) {
        self.hooks_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hooks_failed(&self) {
        self.hooks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            timers_persisted: self.timers_persisted.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            fire_published: self.fire_published.load(Ordering::Relaxed),
            fire_publish_abandoned: self.fire_publish_abandoned.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            timers_completed: self.timers_completed.load(Ordering::Relaxed),
            hooks_fired: self.hooks_fired.load(Ordering::Relaxed),
            hooks_failed: self.hooks_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

pub fn runtime_counters() -> &'static RuntimeCounters {
    static COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();
    COUNTERS.get_or_init(RuntimeCounters::default)
}
