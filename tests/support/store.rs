use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deferhook::domain::ReadyToFire;
use deferhook::store::timers::{
    CREATE_TIMERS, CREATE_TIMERS_TO_FIRE, DELETE_READY_TO_FIRE, INSERT_READY_TO_FIRE,
    INSERT_READY_TO_FIRE_IF_ABSENT, INSERT_TIMER, INSERT_TIMER_IF_ABSENT, SELECT_DUE,
    SELECT_TIMER,
};
use deferhook::store::{Row, SqlValue, Statement, StatementOutcome, StatementRunner, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const TIMER_COLUMNS: [&str; 7] = [
    "id",
    "hours",
    "minutes",
    "seconds",
    "url",
    "created_at",
    "fire_at",
];

/// In-memory stand-in for Postgres that understands the repository's SQL.
///
/// Statements commit one at a time like the real runner, so an injected
/// failure mid-batch leaves the earlier statements applied.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    timers: BTreeMap<Uuid, Vec<SqlValue>>,
    ready: BTreeMap<Uuid, ReadyToFire>,
    tables: Vec<&'static str>,
    batches: Vec<Vec<Statement>>,
    fail_runs: u32,
    fail_on: Vec<(String, u32)>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.lock().expect("mock store state")
    }

    /// The next `count` batches fail before touching anything.
    pub fn fail_next_runs(&self, count: u32) {
        self.state().fail_runs = count;
    }

    /// The next `count` executions of `sql` fail after earlier statements in
    /// the same batch have committed.
    pub fn fail_statement(&self, sql: &str, count: u32) {
        self.state().fail_on.push((sql.to_string(), count));
    }

    pub fn seed_ready(&self, ready: ReadyToFire) {
        let mut state = self.state();
        state.tables.push("timers_to_fire");
        state.ready.insert(ready.id, ready);
    }

    pub fn ready_ids(&self) -> Vec<Uuid> {
        self.state().ready.keys().copied().collect()
    }

    pub fn ready(&self, id: Uuid) -> Option<ReadyToFire> {
        self.state().ready.get(&id).cloned()
    }

    pub fn timer_url(&self, id: Uuid) -> Option<SqlValue> {
        self.state()
            .timers
            .get(&id)
            .and_then(|values| values.get(4).cloned())
    }

    pub fn timer_count(&self) -> usize {
        self.state().timers.len()
    }

    pub fn batches(&self) -> Vec<Vec<Statement>> {
        self.state().batches.clone()
    }

    pub fn executed(&self, sql: &str) -> usize {
        self.state()
            .batches
            .iter()
            .flatten()
            .filter(|statement| statement.sql == sql)
            .count()
    }
}

#[async_trait]
impl StatementRunner for MockStore {
    async fn run(&self, statements: &[Statement]) -> Result<Vec<StatementOutcome>, StoreError> {
        let mut state = self.state();
        state.batches.push(statements.to_vec());

        if state.fail_runs > 0 {
            state.fail_runs -= 1;
            return Err(StoreError::new("connection refused"));
        }

        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            if let Some(entry) = state
                .fail_on
                .iter_mut()
                .find(|(sql, remaining)| *sql == statement.sql && *remaining > 0)
            {
                entry.1 -= 1;
                return Err(StoreError::new("server closed the connection unexpectedly"));
            }
            outcomes.push(state.apply(statement)?);
        }
        Ok(outcomes)
    }
}

impl StoreState {
    fn apply(&mut self, statement: &Statement) -> Result<StatementOutcome, StoreError> {
        let params = &statement.params;
        match statement.sql.as_str() {
            sql if sql == CREATE_TIMERS => {
                self.tables.push("timers");
                Ok(StatementOutcome::Empty)
            }
            sql if sql == CREATE_TIMERS_TO_FIRE => {
                self.tables.push("timers_to_fire");
                Ok(StatementOutcome::Empty)
            }
            sql if sql == INSERT_TIMER || sql == INSERT_TIMER_IF_ABSENT => {
                self.require_table("timers")?;
                let id = uuid_param(params, 0)?;
                if self.timers.contains_key(&id) {
                    return skip_or_violate(sql == INSERT_TIMER_IF_ABSENT, "timers_pkey");
                }
                self.timers.insert(id, params.clone());
                Ok(StatementOutcome::Empty)
            }
            sql if sql == INSERT_READY_TO_FIRE || sql == INSERT_READY_TO_FIRE_IF_ABSENT => {
                self.require_table("timers_to_fire")?;
                let id = uuid_param(params, 0)?;
                if self.ready.contains_key(&id) {
                    return skip_or_violate(
                        sql == INSERT_READY_TO_FIRE_IF_ABSENT,
                        "timers_to_fire_pkey",
                    );
                }
                let ready = ReadyToFire {
                    id,
                    fire_at: timestamp_param(params, 1)?,
                    url: text_param(params, 2)?,
                };
                self.ready.insert(id, ready);
                Ok(StatementOutcome::Empty)
            }
            sql if sql == SELECT_DUE => {
                self.require_table("timers_to_fire")?;
                let now = timestamp_param(params, 0)?;
                let mut due: Vec<&ReadyToFire> =
                    self.ready.values().filter(|ready| ready.fire_at <= now).collect();
                due.sort_by_key(|ready| ready.fire_at);
                Ok(StatementOutcome::Rows(
                    due.into_iter()
                        .map(|ready| {
                            Row::new(vec![
                                ("id".to_string(), SqlValue::Uuid(ready.id)),
                                ("fire_at".to_string(), SqlValue::Timestamp(ready.fire_at)),
                                ("url".to_string(), SqlValue::Text(ready.url.clone())),
                            ])
                        })
                        .collect(),
                ))
            }
            sql if sql == DELETE_READY_TO_FIRE => {
                let id = uuid_param(params, 0)?;
                self.ready.remove(&id);
                Ok(StatementOutcome::Empty)
            }
            sql if sql == SELECT_TIMER => {
                self.require_table("timers")?;
                let id = uuid_param(params, 0)?;
                let rows = self
                    .timers
                    .get(&id)
                    .map(|values| {
                        Row::new(
                            TIMER_COLUMNS
                                .iter()
                                .map(|name| name.to_string())
                                .zip(values.iter().cloned())
                                .collect(),
                        )
                    })
                    .into_iter()
                    .collect();
                Ok(StatementOutcome::Rows(rows))
            }
            other => Err(StoreError::new(format!("unexpected statement `{other}`"))),
        }
    }

    fn require_table(&self, table: &str) -> Result<(), StoreError> {
        if self.tables.iter().any(|name| *name == table) {
            Ok(())
        } else {
            Err(StoreError::new(format!("relation \"{table}\" does not exist")))
        }
    }
}

fn skip_or_violate(skip: bool, constraint: &str) -> Result<StatementOutcome, StoreError> {
    if skip {
        Ok(StatementOutcome::Empty)
    } else {
        Err(StoreError::new(format!(
            "duplicate key value violates unique constraint \"{constraint}\""
        )))
    }
}

fn uuid_param(params: &[SqlValue], index: usize) -> Result<Uuid, StoreError> {
    match params.get(index) {
        Some(SqlValue::Uuid(id)) => Ok(*id),
        other => Err(StoreError::new(format!("param {index} is not a uuid: {other:?}"))),
    }
}

fn timestamp_param(params: &[SqlValue], index: usize) -> Result<DateTime<Utc>, StoreError> {
    match params.get(index) {
        Some(SqlValue::Timestamp(value)) => Ok(*value),
        other => Err(StoreError::new(format!(
            "param {index} is not a timestamp: {other:?}"
        ))),
    }
}

fn text_param(params: &[SqlValue], index: usize) -> Result<String, StoreError> {
    match params.get(index) {
        Some(SqlValue::Text(value)) => Ok(value.clone()),
        other => Err(StoreError::new(format!("param {index} is not text: {other:?}"))),
    }
}
