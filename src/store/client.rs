use crate::store::statement::{Row, SqlValue, Statement, StatementKind, StatementOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, PgConnection, Postgres, Row as _, TypeInfo};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Every store failure, whatever its cause. Callers treat it as transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::new(err.to_string())
    }
}

/// Executes a batch of statements, one outcome per statement in order.
#[async_trait]
pub trait StatementRunner: Send + Sync {
    async fn run(&self, statements: &[Statement]) -> Result<Vec<StatementOutcome>, StoreError>;
}

/// Postgres runner holding a single lazily opened connection.
///
/// Each statement runs in its own transaction and is committed before the
/// next one starts. Any failure drops the cached connection so the next call
/// reconnects.
pub struct PgStatementRunner {
    options: PgConnectOptions,
    endpoint: String,
    connect_timeout: Duration,
    connection: Mutex<Option<PgConnection>>,
}

impl PgStatementRunner {
    pub fn new(options: PgConnectOptions, endpoint: String, connect_timeout: Duration) -> Self {
        Self {
            options,
            endpoint,
            connect_timeout,
            connection: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<PgConnection, StoreError> {
        tracing::info!(
            target: "deferhook::store",
            event = "store_connecting",
            endpoint = %self.endpoint
        );
        let connection =
            tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&self.options))
                .await
                .map_err(|_| {
                    StoreError::new(format!(
                        "connecting to {} timed out after {:?}",
                        self.endpoint, self.connect_timeout
                    ))
                })??;
        tracing::info!(
            target: "deferhook::store",
            event = "store_connected",
            endpoint = %self.endpoint
        );
        Ok(connection)
    }
}

#[async_trait]
impl StatementRunner for PgStatementRunner {
    async fn run(&self, statements: &[Statement]) -> Result<Vec<StatementOutcome>, StoreError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(StoreError::new("store connection unavailable"));
        };

        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            match run_statement(connection, statement).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    tracing::debug!(
                        target: "deferhook::store",
                        event = "store_connection_evicted",
                        endpoint = %self.endpoint,
                        error = %err
                    );
                    guard.take();
                    return Err(err);
                }
            }
        }
        Ok(outcomes)
    }
}

async fn run_statement(
    connection: &mut PgConnection,
    statement: &Statement,
) -> Result<StatementOutcome, StoreError> {
    let mut tx = connection.begin().await?;
    let query = statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_value);

    let outcome = match statement.kind() {
        StatementKind::Read => {
            let rows = query.fetch_all(&mut *tx).await?;
            StatementOutcome::Rows(rows.iter().map(decode_row).collect::<Result<_, _>>()?)
        }
        StatementKind::Schema | StatementKind::Write => {
            query.execute(&mut *tx).await?;
            StatementOutcome::Empty
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(value) => query.bind(*value),
        SqlValue::Int(value) => query.bind(*value),
        SqlValue::BigInt(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.clone()),
        SqlValue::Uuid(value) => query.bind(*value),
        SqlValue::Timestamp(value) => query.bind(*value),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut columns = Vec::with_capacity(row.len());
    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "UUID" => row.try_get::<Option<Uuid>, _>(index)?.map(SqlValue::Uuid),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(index)?
                .map(SqlValue::Timestamp),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(index)?
                .map(|naive| SqlValue::Timestamp(naive.and_utc())),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)?
                .map(|value| SqlValue::Int(i32::from(value))),
            "INT4" => row.try_get::<Option<i32>, _>(index)?.map(SqlValue::Int),
            "INT8" => row.try_get::<Option<i64>, _>(index)?.map(SqlValue::BigInt),
            "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(SqlValue::Bool),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(index)?.map(SqlValue::Text)
            }
            other => {
                return Err(StoreError::new(format!(
                    "unsupported column type `{other}` for `{}`",
                    column.name()
                )))
            }
        };
        columns.push((column.name().to_string(), value.unwrap_or(SqlValue::Null)));
    }
    Ok(Row::new(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Timer, TimerDuration};
    use crate::store::timers::{
        TimerRepository, CREATE_TIMERS, CREATE_TIMERS_TO_FIRE, INSERT_TIMER, SELECT_TIMER,
    };
    use chrono::TimeZone;

    const TEST_DATABASE_ENV: &str = "DEFERHOOK_TEST_DATABASE_URL";
    const DELETE_TIMER: &str = "DELETE FROM timers WHERE id = $1";

    fn live_runner() -> Option<PgStatementRunner> {
        let Ok(url) = std::env::var(TEST_DATABASE_ENV) else {
            eprintln!("{TEST_DATABASE_ENV} not set; skipping live Postgres checks");
            return None;
        };
        let options: PgConnectOptions = url.parse().expect("database url");
        Some(PgStatementRunner::new(
            options,
            "test database".to_string(),
            Duration::from_secs(5),
        ))
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn insert_timer(id: Uuid) -> Statement {
        Statement::new(INSERT_TIMER)
            .bind(id)
            .bind(0)
            .bind(0)
            .bind(5)
            .bind("http://hooks.local/pg")
            .bind(created_at())
            .bind(created_at() + chrono::Duration::seconds(5))
    }

    #[test]
    fn sqlx_errors_collapse_into_store_error() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn unreachable_store_fails_within_connect_timeout() {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("postgres")
            .password("postgres")
            .database("postgres");
        let runner = PgStatementRunner::new(
            options,
            "127.0.0.1:1/postgres".to_string(),
            Duration::from_millis(500),
        );

        let result = runner.run(&[Statement::new("SELECT 1")]).await;

        assert!(result.is_err());
        assert!(runner.connection.lock().await.is_none());
    }

    // Runs as one test so concurrent CREATE TABLE IF NOT EXISTS cannot race.
    #[tokio::test]
    async fn live_postgres_batches_commit_per_statement() {
        let Some(runner) = live_runner() else {
            return;
        };

        let schema = runner
            .run(&[
                Statement::new(CREATE_TIMERS),
                Statement::new(CREATE_TIMERS),
                Statement::new(CREATE_TIMERS_TO_FIRE),
            ])
            .await
            .expect("schema is idempotent");
        assert_eq!(schema, vec![StatementOutcome::Empty; 3]);

        let id = Uuid::new_v4();
        let outcomes = runner
            .run(&[insert_timer(id), Statement::new(SELECT_TIMER).bind(id)])
            .await
            .expect("insert then select");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], StatementOutcome::Empty);
        let rows = outcomes[1].clone().into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uuid("id").expect("id"), id);
        assert_eq!(rows[0].int("seconds").expect("seconds"), 5);
        assert_eq!(rows[0].text("url").expect("url"), "http://hooks.local/pg");
        assert_eq!(rows[0].timestamp("created_at").expect("created"), created_at());

        let duplicate = runner.run(&[insert_timer(id)]).await;
        assert!(duplicate.is_err());
        assert!(runner.connection.lock().await.is_none());

        let committed = Uuid::new_v4();
        let failed = runner
            .run(&[
                insert_timer(committed),
                Statement::new("INSERT INTO deferhook_missing_table VALUES (1)"),
            ])
            .await;
        assert!(failed.is_err());
        assert!(runner.connection.lock().await.is_none());

        let after = runner
            .run(&[
                Statement::new(SELECT_TIMER).bind(committed),
                Statement::new(DELETE_TIMER).bind(committed),
                Statement::new(DELETE_TIMER).bind(id),
            ])
            .await
            .expect("reconnects after eviction");
        assert_eq!(after[0].clone().into_rows().len(), 1);
        assert_eq!(after[1..], [StatementOutcome::Empty, StatementOutcome::Empty]);
        assert!(runner.connection.lock().await.is_some());

        let (Some(first), Some(second)) = (live_runner(), live_runner()) else {
            return;
        };
        let plain = TimerRepository::new(first);
        let deduping = TimerRepository::new(second).with_dedupe_inserts(true);
        let timer = Timer::schedule(
            TimerDuration::new(0, 0, 5).expect("duration"),
            "http://hooks.local/repo",
            created_at(),
        )
        .expect("timer");

        plain.persist(&timer).await.expect("first persist");
        assert!(plain.persist(&timer).await.is_err());
        deduping.persist(&timer).await.expect("duplicate skipped");
        assert_eq!(plain.find(timer.id).await.expect("find"), Some(timer.clone()));
        let due = plain.due(timer.fire_at).await.expect("due");
        assert!(due.contains(&timer.ready_to_fire()));

        plain.remove(timer.id).await.expect("remove");
        let due = plain.due(timer.fire_at).await.expect("due");
        assert!(due.iter().all(|ready| ready.id != timer.id));
    }
}
