#![allow(dead_code)]

pub mod broker;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deferhook::retry::Sleeper;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use broker::{BrokerEvent, MockBroker, SubscriptionStep};
pub use store::MockStore;

/// Sleeper that returns immediately and remembers every requested delay.
///
/// With `cancel_after(n, token)` the token is cancelled on the n-th sleep.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
    cancel: Mutex<Option<(usize, CancellationToken)>>,
}

impl RecordingSleeper {
    pub fn cancel_after(sleeps: usize, token: CancellationToken) -> Self {
        Self {
            delays: Mutex::new(Vec::new()),
            cancel: Mutex::new(Some((sleeps, token))),
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("sleeper delays").clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        let count = {
            let mut delays = self.delays.lock().expect("sleeper delays");
            delays.push(duration);
            delays.len()
        };
        if let Some((after, token)) = self.cancel.lock().expect("sleeper cancel").as_ref() {
            if count >= *after {
                token.cancel();
            }
        }
        tokio::task::yield_now().await;
        shutdown.is_cancelled()
    }
}

pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, second)
        .single()
        .expect("valid timestamp")
}

pub fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}

/// Log lines written by the subscriber installed with [`capture_logs`].
#[derive(Clone, Default)]
pub struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn line_with(&self, needle: &str) -> Option<String> {
        let bytes = self.bytes.lock().expect("log buffer").clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .find(|line| line.contains(needle))
            .map(str::to_string)
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().expect("log buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Routes this thread's events into a buffer until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

/// Reads `name=<n>` out of a logged counter snapshot.
pub fn counter(line: &str, name: &str) -> Option<u64> {
    let start = line.find(&format!("{name}="))? + name.len() + 1;
    let digits: String = line[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
