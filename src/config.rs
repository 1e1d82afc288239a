use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Process-wide settings, built once in `main` and handed to each service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeferhookConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub retry: PublishRetryConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub incoming_queue: String,
    pub to_fire_queue: String,
    pub reconnect_interval_secs: u64,
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            incoming_queue: "unknown_incoming".to_string(),
            to_fire_queue: "timers_to_fire".to_string(),
            reconnect_interval_secs: 2,
            prefetch: 1,
        }
    }
}

impl BrokerConfig {
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode_component(&self.username),
            encode_component(&self.password),
            self.host,
            self.port,
            encode_component(&self.vhost)
        )
    }

    /// Broker address without credentials, safe for logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub dedupe_inserts: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "postgres".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "postgres".to_string(),
            retry_delay_ms: 1_000,
            connect_timeout_secs: 5,
            dedupe_inserts: false,
        }
    }
}

impl StoreConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Fixed pause between whole-batch retries after a store failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
    pub publish_deadline_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            publish_deadline_secs: 30,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn publish_deadline(&self) -> Duration {
        Duration::from_secs(self.publish_deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishRetryConfig {
    pub publish_initial_ms: u64,
    pub publish_max_ms: u64,
    pub publish_multiplier: f64,
}

impl Default for PublishRetryConfig {
    fn default() -> Self {
        Self {
            publish_initial_ms: 1_000,
            publish_max_ms: 10_000,
            publish_multiplier: 2.0,
        }
    }
}

impl PublishRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.publish_initial_ms),
            Duration::from_millis(self.publish_max_ms),
            self.publish_multiplier,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub request_timeout_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

impl TriggerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DeferhookConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let layered = Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("DEFERHOOK").separator("__"))
            .build()?;
        Self::from_config(layered)
    }

    fn from_config(layered: Config) -> Result<Self, ConfigError> {
        let config: Self = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero intervals and timeouts; every loop sleeps on one of them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("broker.reconnect_interval_secs", self.broker.reconnect_interval_secs),
            ("store.retry_delay_ms", self.store.retry_delay_ms),
            ("store.connect_timeout_secs", self.store.connect_timeout_secs),
            ("poller.interval_secs", self.poller.interval_secs),
            ("poller.publish_deadline_secs", self.poller.publish_deadline_secs),
            ("retry.publish_initial_ms", self.retry.publish_initial_ms),
            ("retry.publish_max_ms", self.retry.publish_max_ms),
            ("trigger.request_timeout_secs", self.trigger.request_timeout_secs),
        ];
        match durations.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Message(format!(
                "`{key}` must be greater than zero"
            ))),
            None => Ok(()),
        }
    }
}

fn encode_component(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
