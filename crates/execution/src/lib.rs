//! Execution layer - budget ledger, dispatch cycle, and result collection.

#![warn(missing_docs)]

pub mod alert;
pub mod collector;
pub mod context;
pub mod dispatcher;
pub mod health;
pub mod ledger;
pub mod orchestrator;
pub mod worker;

pub use alert::{AlertSink, LogAlertSink};
pub use collector::{CollectError, IngestOutcome, ResultCollector};
pub use context::OrchestrationContext;
pub use dispatcher::{CycleError, CycleOutcome, CycleReport, DispatchConfig, DispatchError, Dispatcher};
pub use health::{WorkerHealth, WorkerHealthChange, WorkerStatus};
pub use ledger::{BreakerChange, BudgetLedger, DispatchGate, LedgerError, Settlement};
pub use orchestrator::{InboxReport, Orchestrator, OrchestratorError, SystemStatus};
pub use worker::{NotifyError, SpoolNotifier, WebhookNotifier, WorkerNotifier, WorkerRegistry};
