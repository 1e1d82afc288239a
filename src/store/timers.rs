//! SQL for the `timers` and `timers_to_fire` tables.
//!
//! Every batch that touches a table first issues its `CREATE TABLE IF NOT
//! EXISTS`, so no separate migration step exists.

use crate::domain::{ReadyToFire, Timer, TimerDuration};
use crate::store::client::{StatementRunner, StoreError};
use crate::store::statement::{Row, Statement, StatementOutcome};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const CREATE_TIMERS: &str = "CREATE TABLE IF NOT EXISTS timers (\
     id UUID PRIMARY KEY, \
     hours INTEGER, \
     minutes INTEGER, \
     seconds INTEGER, \
     url TEXT, \
     created_at TIMESTAMP WITH TIME ZONE, \
     fire_at TIMESTAMP WITH TIME ZONE)";

pub const CREATE_TIMERS_TO_FIRE: &str = "CREATE TABLE IF NOT EXISTS timers_to_fire (\
     id UUID PRIMARY KEY, \
     fire_at TIMESTAMP WITH TIME ZONE, \
     url TEXT)";

pub const INSERT_TIMER: &str = "INSERT INTO timers \
     (id, hours, minutes, seconds, url, created_at, fire_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

pub const INSERT_READY_TO_FIRE: &str = "INSERT INTO timers_to_fire (id, fire_at, url) \
     VALUES ($1, $2, $3)";

pub const INSERT_TIMER_IF_ABSENT: &str = "INSERT INTO timers \
     (id, hours, minutes, seconds, url, created_at, fire_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) \
     ON CONFLICT (id) DO NOTHING";

pub const INSERT_READY_TO_FIRE_IF_ABSENT: &str = "INSERT INTO timers_to_fire (id, fire_at, url) \
     VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING";

pub const SELECT_DUE: &str =
    "SELECT id, fire_at, url FROM timers_to_fire WHERE fire_at <= $1 ORDER BY fire_at";

pub const DELETE_READY_TO_FIRE: &str = "DELETE FROM timers_to_fire WHERE id = $1";

// Naming the creation column here would classify the query as schema.
pub const SELECT_TIMER: &str = "SELECT * FROM timers WHERE id = $1";

pub struct TimerRepository<R> {
    runner: R,
    dedupe_inserts: bool,
}

impl<R> TimerRepository<R>
where
    R: StatementRunner,
{
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            dedupe_inserts: false,
        }
    }

    /// Skip inserts whose id already exists instead of failing on the key.
    pub fn with_dedupe_inserts(mut self, dedupe: bool) -> Self {
        self.dedupe_inserts = dedupe;
        self
    }

    /// Writes the timer and its ready-to-fire row as one batch.
    ///
    /// Statements commit one by one, so a failed batch may leave a prefix
    /// behind. Plain inserts then hit the primary key on every rerun of the
    /// batch; with deduplication enabled existing ids are skipped and the
    /// first stored payload wins.
    pub async fn persist(&self, timer: &Timer) -> Result<(), StoreError> {
        let (insert_timer, insert_ready) = if self.dedupe_inserts {
            (INSERT_TIMER_IF_ABSENT, INSERT_READY_TO_FIRE_IF_ABSENT)
        } else {
            (INSERT_TIMER, INSERT_READY_TO_FIRE)
        };
        let ready = timer.ready_to_fire();
        let batch = [
            Statement::new(CREATE_TIMERS),
            Statement::new(insert_timer)
                .bind(timer.id)
                .bind(component(timer.duration.hours)?)
                .bind(component(timer.duration.minutes)?)
                .bind(component(timer.duration.seconds)?)
                .bind(timer.url.as_str())
                .bind(timer.created_at)
                .bind(timer.fire_at),
            Statement::new(CREATE_TIMERS_TO_FIRE),
            Statement::new(insert_ready)
                .bind(ready.id)
                .bind(ready.fire_at)
                .bind(ready.url),
        ];
        self.runner.run(&batch).await?;
        Ok(())
    }

    /// Ready-to-fire rows whose fire time is at or before `now`, oldest first.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ReadyToFire>, StoreError> {
        let batch = [
            Statement::new(CREATE_TIMERS_TO_FIRE),
            Statement::new(SELECT_DUE).bind(now),
        ];
        let outcomes = self.runner.run(&batch).await?;
        nth_rows(outcomes, 1)?
            .iter()
            .map(ready_from_row)
            .collect()
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        self.runner
            .run(&[Statement::new(DELETE_READY_TO_FIRE).bind(id)])
            .await?;
        Ok(())
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Timer>, StoreError> {
        let batch = [
            Statement::new(CREATE_TIMERS),
            Statement::new(SELECT_TIMER).bind(id),
        ];
        let outcomes = self.runner.run(&batch).await?;
        nth_rows(outcomes, 1)?
            .first()
            .map(timer_from_row)
            .transpose()
    }
}

fn component(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::new(format!("duration component {value} exceeds INTEGER")))
}

fn nth_rows(outcomes: Vec<StatementOutcome>, index: usize) -> Result<Vec<Row>, StoreError> {
    outcomes
        .into_iter()
        .nth(index)
        .map(StatementOutcome::into_rows)
        .ok_or_else(|| StoreError::new(format!("batch returned no result for statement {index}")))
}

fn ready_from_row(row: &Row) -> Result<ReadyToFire, StoreError> {
    Ok(ReadyToFire {
        id: row.uuid("id")?,
        fire_at: row.timestamp("fire_at")?,
        url: row.text("url")?,
    })
}

fn timer_from_row(row: &Row) -> Result<Timer, StoreError> {
    let stored = |column: &str| -> Result<u32, StoreError> {
        let value = row.int(column)?;
        u32::try_from(value)
            .map_err(|_| StoreError::new(format!("column `{column}` holds {value}")))
    };
    Ok(Timer {
        id: row.uuid("id")?,
        duration: TimerDuration {
            hours: stored("hours")?,
            minutes: stored("minutes")?,
            seconds: stored("seconds")?,
        },
        url: row.text("url")?,
        created_at: row.timestamp("created_at")?,
        fire_at: row.timestamp("fire_at")?,
    })
}
