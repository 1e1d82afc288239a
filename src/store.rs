pub mod client;
pub mod statement;
pub mod timers;

pub use client::{PgStatementRunner, StatementRunner, StoreError};
pub use statement::{Row, SqlValue, Statement, StatementKind, StatementOutcome};
pub use timers::TimerRepository;
