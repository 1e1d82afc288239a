//! Timers, their ready-to-fire projection, and the JSON messages that move
//! them between services.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer id `{0}` is not a UUID")]
    InvalidId(String),
    #[error("timer url `{url}` is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("duration component `{component}` ({value}) exceeds the storable range")]
    DurationOutOfRange { component: &'static str, value: u32 },
    #[error("fire_at {fire_at} precedes created_at {created_at}")]
    FiresBeforeCreation {
        created_at: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerDuration {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl TimerDuration {
    pub fn new(hours: u32, minutes: u32, seconds: u32) -> Result<Self, TimerError> {
        let duration = Self {
            hours,
            minutes,
            seconds,
        };
        duration.validate()?;
        Ok(duration)
    }

    /// Components are stored as SQL `INTEGER`.
    fn validate(&self) -> Result<(), TimerError> {
        for (component, value) in [
            ("hours", self.hours),
            ("minutes", self.minutes),
            ("seconds", self.seconds),
        ] {
            if i32::try_from(value).is_err() {
                return Err(TimerError::DurationOutOfRange { component, value });
            }
        }
        Ok(())
    }

    pub fn as_chrono(&self) -> ChronoDuration {
        ChronoDuration::hours(i64::from(self.hours))
            + ChronoDuration::minutes(i64::from(self.minutes))
            + ChronoDuration::seconds(i64::from(self.seconds))
    }
}

/// A scheduled callback. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub id: Uuid,
    pub duration: TimerDuration,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
}

impl Timer {
    /// Builds a new timer with a fresh id, due `duration` after `now`.
    pub fn schedule(
        duration: TimerDuration,
        url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, TimerError> {
        let url = url.into();
        validate_url(&url)?;
        duration.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            duration,
            url,
            created_at: now,
            fire_at: now + duration.as_chrono(),
        })
    }

    /// Whole seconds until the timer fires; zero once it is due.
    pub fn time_left(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.fire_at - now;
        u64::try_from(remaining.num_seconds()).unwrap_or(0)
    }

    pub fn ready_to_fire(&self) -> ReadyToFire {
        ReadyToFire {
            id: self.id,
            fire_at: self.fire_at,
            url: self.url.clone(),
        }
    }

    pub fn to_message(&self) -> CreateTimerMessage {
        CreateTimerMessage {
            id: self.id.to_string(),
            hours: self.duration.hours,
            minutes: self.duration.minutes,
            seconds: self.duration.seconds,
            url: self.url.clone(),
            created_at: self.created_at,
            fire_at: self.fire_at,
        }
    }
}

/// A timer that has not yet been handed to the to-fire queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyToFire {
    pub id: Uuid,
    pub fire_at: DateTime<Utc>,
    pub url: String,
}

impl ReadyToFire {
    pub fn fire_message(&self) -> FireHookMessage {
        FireHookMessage {
            id: self.id.to_string(),
            url: self.url.clone(),
        }
    }
}

/// Body of a message on the incoming queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTimerMessage {
    pub id: String,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub url: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub fire_at: DateTime<Utc>,
}

impl TryFrom<CreateTimerMessage> for Timer {
    type Error = TimerError;

    fn try_from(message: CreateTimerMessage) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(message.id.trim())
            .map_err(|_| TimerError::InvalidId(message.id.clone()))?;
        let duration = TimerDuration::new(message.hours, message.minutes, message.seconds)?;
        validate_url(&message.url)?;
        if message.fire_at < message.created_at {
            return Err(TimerError::FiresBeforeCreation {
                created_at: message.created_at,
                fire_at: message.fire_at,
            });
        }

        Ok(Timer {
            id,
            duration,
            url: message.url,
            created_at: message.created_at,
            fire_at: message.fire_at,
        })
    }
}

/// Body of a message on the to-fire queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireHookMessage {
    pub id: String,
    pub url: String,
}

impl FireHookMessage {
    pub fn callback(&self) -> HookCallback {
        HookCallback {
            id: self.id.clone(),
        }
    }
}

/// JSON body POSTed to the timer's URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCallback {
    pub id: String,
}

fn validate_url(raw: &str) -> Result<(), TimerError> {
    let parsed = url::Url::parse(raw).map_err(|err| TimerError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(TimerError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

/// ISO-8601 timestamps, written as RFC 3339.
///
/// Reading also accepts the space-separated `YYYY-MM-DD HH:MM:SS[.f][+HH:MM]`
/// form some producers emit; values without an offset are taken as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"];
    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        for format in OFFSET_FORMATS {
            if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(|naive| naive.and_utc())
    }
}
