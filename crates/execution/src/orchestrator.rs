//! Orchestrator facade - wires the store, ledger, dispatcher and collector.
//!
//! One process owns a data directory at a time (see [`JsonStore::open`]).
//! Producers and workers in other processes hand their declarations and
//! results to [`Orchestrator::submit`], which drops them into the inbox; the
//! owning process applies the inbox before every cycle.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use constellation_core::{
    AgentId, CapitalRequest, ConfigError, Event, EventKind, OrchestratorConfig, Task, TaskDeclaration,
    TaskFilter, TaskId, TaskResult, TaskState, TaskStats, Time, TierName, TierStatus,
};
use constellation_storage::{Inbox, InboxItem, JsonStore, Journal, MemoryStore, StoreError, TaskStore};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::collector::{CollectError, IngestOutcome, ResultCollector};
use crate::context::OrchestrationContext;
use crate::dispatcher::{CycleOutcome, DispatchConfig, DispatchError, Dispatcher};
use crate::health::{WorkerHealth, WorkerStatus};
use crate::ledger::{BudgetLedger, LedgerError};
use crate::worker::{NotifyError, WorkerRegistry};

/// Errors from the facade.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Task store failure
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Ledger failure
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    /// A worker transport could not be set up
    #[error("worker: {0}")]
    Worker(#[from] NotifyError),

    /// Dispatch cycle failure
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Result ingestion failure
    #[error(transparent)]
    Collect(#[from] CollectError),
}

/// Result alias for facade operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Administrative view of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Per-tier ledger status
    pub tiers: Vec<TierStatus>,
    /// Task counts per state
    pub tasks: TaskStats,
    /// Per-worker liveness
    pub workers: Vec<WorkerStatus>,
}

/// What applying the inbox did.
#[derive(Debug, Default)]
pub struct InboxReport {
    /// Declarations accepted as tasks
    pub enqueued: Vec<TaskId>,
    /// Results handed to the collector
    pub ingested: Vec<IngestOutcome>,
    /// Submissions set aside, with the reason
    pub rejected: Vec<(PathBuf, String)>,
}

impl InboxReport {
    /// Whether nothing was waiting.
    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty() && self.ingested.is_empty() && self.rejected.is_empty()
    }
}

/// Entry point for producers, workers and operators.
pub struct Orchestrator {
    config: OrchestratorConfig,
    ctx: OrchestrationContext,
    dispatcher: Arc<Dispatcher>,
    collector: ResultCollector,
    inbox: Option<Inbox>,
}

impl Orchestrator {
    /// Open durable state under `config.data_dir` as its single writer,
    /// restoring the ledger snapshot if one exists and reconciling it with
    /// the task table.
    ///
    /// Fails with [`StoreError::Locked`] while another process has the
    /// directory open.
    pub async fn open(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(JsonStore::open(&config.data_dir).await?);
        let ledger = restore_ledger(&store, &config).await?;
        let inbox = Inbox::for_data_dir(store.root());
        let mut orchestrator = Self::assemble(config, store.clone(), store, ledger)?;
        orchestrator.inbox = Some(inbox);
        orchestrator.reconcile(Utc::now()).await?;
        Ok(orchestrator)
    }

    /// Open durable state for inspection. Works while another process owns
    /// the directory; every mutation fails with [`StoreError::ReadOnly`].
    pub async fn open_read_only(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(JsonStore::open_read_only(&config.data_dir).await?);
        let ledger = restore_ledger(&store, &config).await?;
        let orchestrator = Self::assemble(config, store.clone(), store, ledger)?;
        let assigned = orchestrator.ctx.store.list(&assigned_filter()).await?;
        orchestrator.ctx.health.seed(&assigned).await;
        Ok(orchestrator)
    }

    /// Volatile orchestrator, for tests and dry runs.
    pub fn in_memory(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MemoryStore::new());
        let ledger = BudgetLedger::new(config.tiers.clone());
        Self::assemble(config, store.clone(), store, ledger)
    }

    /// Wire everything from explicit parts.
    pub fn assemble(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        journal: Arc<dyn Journal>,
        ledger: BudgetLedger,
    ) -> Result<Self> {
        let ctx = OrchestrationContext::new(store, journal, Arc::new(ledger));
        let registry = WorkerRegistry::from_config(&config.workers)?;
        Ok(Self::with_context(config, ctx, registry))
    }

    /// Wire from a prepared context and worker registry. Worker liveness is
    /// tracked for the workers in `registry`.
    pub fn with_context(config: OrchestratorConfig, ctx: OrchestrationContext, registry: WorkerRegistry) -> Self {
        let ctx = ctx.with_health(Arc::new(WorkerHealth::from_registry(&registry)));
        let dispatcher = Dispatcher::new(ctx.clone(), registry).with_config(DispatchConfig::from(&config));
        let collector = ResultCollector::new(ctx.clone());
        Self {
            config,
            ctx,
            dispatcher: Arc::new(dispatcher),
            collector,
            inbox: None,
        }
    }

    /// Hand a declaration or result to whichever process owns
    /// `config.data_dir`. Capital requests and deltas are checked against
    /// the configuration first. Returns the submission file.
    pub async fn submit(config: &OrchestratorConfig, item: InboxItem) -> Result<PathBuf> {
        match &item {
            InboxItem::Task(decl) => {
                if let Some(capital) = &decl.capital {
                    check_capital(config, capital)?;
                }
            }
            InboxItem::Result(result) => {
                if !result.capital_delta.is_finite() {
                    return Err(LedgerError::InvalidAmount(result.capital_delta).into());
                }
            }
        }
        Ok(Inbox::for_data_dir(&config.data_dir).submit(&item).await?)
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// The result collector.
    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    /// Shared state handles.
    pub fn context(&self) -> &OrchestrationContext {
        &self.ctx
    }

    /// Accept a task declaration as a new `pending` task.
    ///
    /// A capital request must name a configured tier.
    pub async fn enqueue(&self, decl: TaskDeclaration) -> Result<Task> {
        let now = Utc::now();
        let task = Task::from_declaration(decl, now);
        if let Some(capital) = &task.capital {
            check_capital(&self.config, capital)?;
        }

        self.ctx.store.enqueue(task.clone()).await?;
        info!("Enqueued task {} ({}, priority {})", task.id, task.kind, task.priority);
        let detail = format!("kind {}, priority {}", task.kind, task.priority);
        self.ctx
            .record(Event::new(AgentId::operator(), EventKind::TaskEnqueued, detail, now).for_task(&task.id))
            .await;
        Ok(task)
    }

    /// Look up a task.
    pub async fn task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.ctx.store.get(id).await?)
    }

    /// List tasks matching a filter.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.ctx.store.list(filter).await?)
    }

    /// Most recent journal entries.
    pub async fn events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        Ok(self.ctx.journal.list_events(limit).await?)
    }

    /// Ingest a worker result.
    pub async fn ingest(&self, result: TaskResult) -> Result<IngestOutcome> {
        Ok(self.collector.ingest(result).await?)
    }

    /// Apply pending inbox submissions in arrival order. Submissions that
    /// fail are renamed `*.rejected` and journaled; the rest are removed.
    pub async fn drain_inbox(&self) -> Result<InboxReport> {
        let mut report = InboxReport::default();
        let Some(inbox) = &self.inbox else {
            return Ok(report);
        };

        for entry in inbox.pending().await? {
            let applied = match entry.item.clone() {
                InboxItem::Task(decl) => self.enqueue(decl).await.map(|task| report.enqueued.push(task.id)),
                InboxItem::Result(result) => self.ingest(result).await.map(|outcome| report.ingested.push(outcome)),
            };
            match applied {
                Ok(()) => inbox.complete(&entry).await?,
                Err(e) => {
                    warn!("Rejecting submission {}: {}", entry.path.display(), e);
                    let detail = format!("{}: {e}", entry.path.display());
                    self.ctx
                        .record(Event::new(AgentId::operator(), EventKind::SubmissionRejected, detail, Utc::now()))
                        .await;
                    inbox.reject(&entry.path).await?;
                    report.rejected.push((entry.path, e.to_string()));
                }
            }
        }

        if !report.is_empty() {
            info!(
                "Inbox applied: {} enqueued, {} results, {} rejected",
                report.enqueued.len(),
                report.ingested.len(),
                report.rejected.len()
            );
        }
        Ok(report)
    }

    /// Tier, task and worker status.
    pub async fn status(&self) -> Result<SystemStatus> {
        self.status_at(Utc::now()).await
    }

    /// Status as of `now`.
    pub async fn status_at(&self, now: Time) -> Result<SystemStatus> {
        Ok(SystemStatus {
            tiers: self.ctx.ledger.status().await,
            tasks: self.ctx.store.stats().await?,
            workers: self.ctx.health.status(now, self.config.worker_silence()).await,
        })
    }

    /// Operator reset of a tier's capacity baseline.
    pub async fn reset_tier(&self, tier: &TierName, new_allocated: f64) -> Result<TierStatus> {
        let now = Utc::now();
        let status = self.ctx.ledger.reset_tier(tier, new_allocated).await?;
        self.ctx
            .record(
                Event::new(AgentId::operator(), EventKind::TierReset, format!("rebased to {new_allocated}"), now)
                    .for_tier(tier),
            )
            .await;
        self.ctx.publish_breaker_changes(AgentId::operator(), now).await;
        self.ctx.persist_ledger(now).await?;
        Ok(status)
    }

    /// Bring the ledger in line with the task table after a restart.
    ///
    /// An open reservation held by an assigned task stays open. One whose
    /// task already finished is settled with the recorded delta; any other
    /// is released. A reservation an assigned task holds but the ledger
    /// lost is adopted again. Returns the number of repairs.
    pub async fn reconcile(&self, now: Time) -> Result<usize> {
        let assigned = self.ctx.store.list(&assigned_filter()).await?;
        let held: HashSet<_> = assigned
            .iter()
            .filter_map(|task| task.reservation.as_ref().map(|r| r.id))
            .collect();
        let mut repaired = 0;

        for reservation in self.ctx.ledger.open_reservations().await {
            if held.contains(&reservation.id) {
                continue;
            }
            let finished = match &reservation.task_id {
                Some(id) => self.ctx.store.get(id).await?,
                None => None,
            };
            let delta = finished
                .filter(|task| matches!(task.state, TaskState::Succeeded | TaskState::Failed))
                .filter(|task| task.reservation.as_ref().is_some_and(|r| r.id == reservation.id))
                .and_then(|task| task.result.map(|result| result.capital_delta));

            let repair = match delta {
                Some(delta) => self.ctx.ledger.settle(&reservation, delta).await,
                None => self.ctx.ledger.release(&reservation).await,
            };
            match repair {
                Ok(settlement) => {
                    warn!(
                        "Closed stray reservation {} on tier {} (allocated now {})",
                        reservation.id, reservation.tier, settlement.allocated
                    );
                    repaired += 1;
                }
                Err(e) => warn!("Could not close stray reservation {}: {}", reservation.id, e),
            }
        }

        for task in &assigned {
            let Some(reservation) = &task.reservation else { continue };
            match self.ctx.ledger.adopt(reservation).await {
                Ok(true) => repaired += 1,
                Ok(false) => {}
                Err(e) => warn!("Task {} holds an unusable reservation: {}", task.id, e),
            }
        }

        self.ctx.health.seed(&assigned).await;

        if repaired > 0 {
            self.ctx.publish_breaker_changes(AgentId::operator(), now).await;
            self.ctx.persist_ledger(now).await?;
        }
        Ok(repaired)
    }

    /// Apply the inbox, then run one dispatch cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.drain_inbox().await?;
        Ok(self.dispatcher.run_cycle(Utc::now()).await?)
    }

    /// Run the timeout sweep now.
    pub async fn sweep(&self) -> Result<CycleOutcome> {
        Ok(self.dispatcher.sweep(Utc::now()).await?)
    }

    /// Run cycles every `dispatch_cycle_interval`, `cycles` times or until
    /// Ctrl-C. Returns the number of cycles that ran.
    pub async fn run(&self, cycles: Option<usize>) -> Result<usize> {
        let mut interval = tokio::time::interval(self.config.dispatch_cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ran = 0;

        loop {
            if cycles.is_some_and(|max| ran >= max) {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping after {} cycles", ran);
                    break;
                }
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Ran(report)) => {
                    ran += 1;
                    if !report.errors.is_empty() {
                        warn!("Cycle {} finished with {} errors", report.cycle, report.errors.len());
                    }
                }
                Ok(CycleOutcome::Overlapped) => {}
                Err(e) => error!("Dispatch cycle aborted: {}", e),
            }
        }
        Ok(ran)
    }
}

async fn restore_ledger(store: &JsonStore, config: &OrchestratorConfig) -> Result<BudgetLedger> {
    Ok(match store.load_ledger().await? {
        Some(snapshot) => {
            info!("Restored ledger snapshot from {}", store.root().display());
            BudgetLedger::from_snapshot(snapshot, config.tiers.clone())
        }
        None => BudgetLedger::new(config.tiers.clone()),
    })
}

fn check_capital(config: &OrchestratorConfig, capital: &CapitalRequest) -> Result<()> {
    if !capital.amount.is_finite() || capital.amount < 0.0 {
        return Err(LedgerError::InvalidAmount(capital.amount).into());
    }
    if !config.tiers.iter().any(|tier| tier.name == capital.tier) {
        return Err(LedgerError::UnknownTier(capital.tier.clone()).into());
    }
    Ok(())
}

fn assigned_filter() -> TaskFilter {
    TaskFilter {
        state: Some(vec![TaskState::Assigned]),
        ..Default::default()
    }
}
