use crate::store::StoreError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const SCHEMA_KEYWORDS: [&str; 4] = ["CREATE", "ALTER", "DROP", "TRUNCATE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Schema,
    Read,
    Write,
}

impl StatementKind {
    /// Schema keywords win wherever they appear, so a `SELECT` naming a
    /// `created_at` column counts as schema and returns no rows.
    pub fn classify(sql: &str) -> Self {
        let upper = sql.to_ascii_uppercase();
        if SCHEMA_KEYWORDS.iter().any(|keyword| upper.contains(keyword)) {
            StatementKind::Schema
        } else if upper.trim_start().starts_with("SELECT") {
            StatementKind::Read
        } else {
            StatementKind::Write
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        SqlValue::Uuid(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

/// SQL text plus positional (`$1`, `$2`, ...) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn kind(&self) -> StatementKind {
        StatementKind::classify(&self.sql)
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    fn require(&self, column: &str) -> Result<&SqlValue, StoreError> {
        self.get(column)
            .ok_or_else(|| StoreError::new(format!("column `{column}` missing from row")))
    }

    pub fn uuid(&self, column: &str) -> Result<Uuid, StoreError> {
        match self.require(column)? {
            SqlValue::Uuid(value) => Ok(*value),
            SqlValue::Text(text) => Uuid::parse_str(text)
                .map_err(|err| StoreError::new(format!("column `{column}`: {err}"))),
            other => Err(mismatch(column, "uuid", other)),
        }
    }

    pub fn text(&self, column: &str) -> Result<String, StoreError> {
        match self.require(column)? {
            SqlValue::Text(value) => Ok(value.clone()),
            other => Err(mismatch(column, "text", other)),
        }
    }

    pub fn int(&self, column: &str) -> Result<i64, StoreError> {
        match self.require(column)? {
            SqlValue::Int(value) => Ok(i64::from(*value)),
            SqlValue::BigInt(value) => Ok(*value),
            other => Err(mismatch(column, "integer", other)),
        }
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, StoreError> {
        match self.require(column)? {
            SqlValue::Timestamp(value) => Ok(*value),
            other => Err(mismatch(column, "timestamp", other)),
        }
    }
}

fn mismatch(column: &str, expected: &str, found: &SqlValue) -> StoreError {
    StoreError::new(format!(
        "column `{column}` expected {expected}, found {found:?}"
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Rows(Vec<Row>),
    Empty,
}

impl StatementOutcome {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            StatementOutcome::Rows(rows) => rows,
            StatementOutcome::Empty => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_keywords_match_anywhere_ignoring_case() {
        assert_eq!(
            StatementKind::classify("create table if not exists t (id int)"),
            StatementKind::Schema
        );
        assert_eq!(
            StatementKind::classify("  Alter TABLE t ADD c int"),
            StatementKind::Schema
        );
        assert_eq!(StatementKind::classify("drop table t"), StatementKind::Schema);
        assert_eq!(
            StatementKind::classify("TRUNCATE timers_to_fire"),
            StatementKind::Schema
        );
        assert_eq!(
            StatementKind::classify("SELECT created_at FROM timers"),
            StatementKind::Schema
        );
    }

    #[test]
    fn select_prefix_is_read_everything_else_is_write() {
        assert_eq!(
            StatementKind::classify("\n  select id from timers_to_fire  "),
            StatementKind::Read
        );
        assert_eq!(
            StatementKind::classify("DELETE FROM timers_to_fire WHERE id = $1"),
            StatementKind::Write
        );
        assert_eq!(
            StatementKind::classify("WITH x AS (SELECT 1) SELECT * FROM x"),
            StatementKind::Write
        );
    }

    #[test]
    fn row_getters_convert_and_report_mismatches() {
        let id = Uuid::new_v4();
        let row = Row::new(vec![
            ("id".to_string(), SqlValue::Uuid(id)),
            ("hours".to_string(), SqlValue::Int(3)),
            ("url".to_string(), SqlValue::Text("http://x".to_string())),
        ]);

        assert_eq!(row.uuid("id").expect("id"), id);
        assert_eq!(row.int("hours").expect("hours"), 3);
        assert_eq!(row.text("url").expect("url"), "http://x");
        assert!(row.timestamp("url").is_err());
        assert!(row.text("missing").is_err());
    }
}
