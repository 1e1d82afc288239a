pub mod ingest;
pub mod poller;
pub mod supervisor;
pub mod trigger;

pub use ingest::{IngestHandler, IngestionConsumer};
pub use poller::{CycleReport, ExpiryPoller, PollerSettings};
pub use supervisor::supervise;
pub use trigger::{HookSender, ReqwestHookSender, TriggerError, TriggerHandler, TriggerService};
