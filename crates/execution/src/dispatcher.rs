//! The dispatcher - assigns eligible tasks to workers, one cycle at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use constellation_core::{
    AgentId, Assignment, DispatchNotice, Event, EventKind, OrchestratorConfig, Reservation, Task,
    TaskFilter, TaskId, TaskState, Time,
};
use constellation_storage::{EligibleTasks, ExpiryAction, StoreError};
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::OrchestrationContext;
use crate::ledger::{DispatchGate, LedgerError};
use crate::worker::{NotifyError, WorkerNotifier, WorkerRegistry};

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum assignment attempts per task
    pub max_attempts: u32,
    /// Age after which an assignment is reclaimed
    pub max_assignment_age: Duration,
    /// Time allowed for one worker notification
    pub notify_timeout: Duration,
    /// Cap on assignments per cycle (None = unbounded)
    pub max_dispatch_per_cycle: Option<usize>,
    /// How long a worker may leave an assignment unanswered
    pub worker_silence: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_assignment_age: Duration::from_secs(3600),
            notify_timeout: Duration::from_secs(10),
            max_dispatch_per_cycle: None,
            worker_silence: Duration::from_secs(7200),
        }
    }
}

impl From<&OrchestratorConfig> for DispatchConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_assignment_age: config.max_assignment_age(),
            notify_timeout: config.notify_timeout(),
            max_dispatch_per_cycle: config.max_dispatch_per_cycle,
            worker_silence: config.worker_silence(),
        }
    }
}

/// Failure surfaced from a cycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Task store rejected an operation
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Ledger rejected an operation
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// A structural failure tied to one task (or to the cycle as a whole).
#[derive(Debug)]
pub struct CycleError {
    /// Task involved, if any
    pub task_id: Option<TaskId>,
    /// What failed
    pub error: DispatchError,
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Cycle number (1-based)
    pub cycle: usize,
    /// Tasks handed to a worker
    pub assigned: Vec<TaskId>,
    /// Tasks whose tier could not cover the reservation
    pub skipped_capacity: Vec<TaskId>,
    /// Tasks refused by a tripped breaker
    pub skipped_breaker: Vec<TaskId>,
    /// Tasks with no worker for their kind
    pub unroutable: Vec<TaskId>,
    /// Tasks whose worker could not be notified
    pub notify_failed: Vec<TaskId>,
    /// Timed-out tasks returned to pending
    pub requeued: Vec<TaskId>,
    /// Tasks abandoned, timed out on their last attempt or found pending
    /// with no attempts left
    pub abandoned: Vec<TaskId>,
    /// Workers newly reported silent
    pub silent_workers: Vec<String>,
    /// Structural failures
    pub errors: Vec<CycleError>,
}

impl CycleReport {
    fn error(&mut self, task_id: Option<&TaskId>, error: impl Into<DispatchError>) {
        let error = error.into();
        match task_id {
            Some(id) => error!("Dispatch of task {} failed: {}", id, error),
            None => error!("Dispatch cycle failed: {}", error),
        }
        self.errors.push(CycleError { task_id: task_id.cloned(), error });
    }
}

/// Result of asking for a cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The cycle ran
    Ran(CycleReport),
    /// Another cycle was still running; nothing was done
    Overlapped,
}

/// A task assigned during the scan whose worker has not been notified yet.
struct Staged {
    task: Task,
    worker: String,
    notifier: Arc<dyn WorkerNotifier>,
    notice: DispatchNotice,
}

/// The dispatcher.
///
/// Runs the dispatch cycle:
/// ```text
/// Sweep timeouts -> Scan eligible -> Gate + Reserve -> Assign -> Notify (concurrently)
/// ```
/// Cycles never overlap: a call made while another is in flight returns
/// [`CycleOutcome::Overlapped`] immediately.
pub struct Dispatcher {
    ctx: OrchestrationContext,
    registry: WorkerRegistry,
    config: DispatchConfig,
    run_lock: Mutex<()>,
    cycles_run: AtomicUsize,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(ctx: OrchestrationContext, registry: WorkerRegistry) -> Self {
        Self {
            ctx,
            registry,
            config: DispatchConfig::default(),
            run_lock: Mutex::new(()),
            cycles_run: AtomicUsize::new(0),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Get cycles run so far.
    pub fn cycles(&self) -> usize {
        self.cycles_run.load(Ordering::SeqCst)
    }

    /// Worker routing table.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Run one dispatch cycle at `now`.
    ///
    /// Per-task failures are collected in the report; only a failure to read
    /// the store aborts the cycle.
    pub async fn run_cycle(&self, now: Time) -> Result<CycleOutcome, DispatchError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Dispatch cycle still running, skipping this tick");
            return Ok(CycleOutcome::Overlapped);
        };

        let cycle = self.cycles_run.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Starting dispatch cycle {}", cycle);
        let mut report = CycleReport { cycle, ..Default::default() };

        self.sweep_expired(now, &mut report).await?;

        let mut staged = Vec::new();
        let mut scan = EligibleTasks::new(self.ctx.store.as_ref(), now);
        let scanned = loop {
            let task = match scan.next().await {
                Ok(Some(task)) => task,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if let Some(max) = self.config.max_dispatch_per_cycle {
                if staged.len() >= max {
                    debug!("Cycle {} reached its dispatch cap ({})", cycle, max);
                    break Ok(());
                }
            }
            if let Some(entry) = self.stage(task, now, &mut report).await {
                staged.push(entry);
            }
        };
        // Tasks already assigned are notified even if the scan broke off.
        self.deliver(staged, now, &mut report).await;
        scanned?;

        let silent = self.ctx.health.check(now, self.config.worker_silence).await;
        self.ctx.publish_worker_changes(&silent, AgentId::dispatcher()).await;
        report.silent_workers = silent.into_iter().map(|change| change.worker).collect();

        self.ctx.publish_breaker_changes(AgentId::dispatcher(), now).await;
        if let Err(e) = self.ctx.persist_ledger(now).await {
            report.error(None, e);
        }

        info!(
            "Cycle {} done: {} assigned, {} skipped (capacity), {} skipped (breaker), {} unroutable, {} requeued, {} abandoned",
            cycle,
            report.assigned.len(),
            report.skipped_capacity.len(),
            report.skipped_breaker.len(),
            report.unroutable.len(),
            report.requeued.len(),
            report.abandoned.len(),
        );
        Ok(CycleOutcome::Ran(report))
    }

    /// Run only the timeout sweep, serialized with cycles.
    pub async fn sweep(&self, now: Time) -> Result<CycleOutcome, DispatchError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Ok(CycleOutcome::Overlapped);
        };
        let mut report = CycleReport::default();
        self.sweep_expired(now, &mut report).await?;
        self.ctx.publish_breaker_changes(AgentId::dispatcher(), now).await;
        if let Err(e) = self.ctx.persist_ledger(now).await {
            report.error(None, e);
        }
        Ok(CycleOutcome::Ran(report))
    }

    /// Reclaim assignments older than `max_assignment_age`.
    async fn sweep_expired(&self, now: Time, report: &mut CycleReport) -> Result<(), DispatchError> {
        let filter = TaskFilter {
            state: Some(vec![TaskState::Assigned]),
            ..Default::default()
        };
        let assigned = self.ctx.store.list(&filter).await?;

        for task in assigned {
            let expiry = match self
                .ctx
                .store
                .expire_assignment(&task.id, now, self.config.max_assignment_age, self.config.max_attempts)
                .await
            {
                Ok(Some(expiry)) => expiry,
                Ok(None) => continue,
                Err(e) => {
                    report.error(Some(&task.id), e);
                    continue;
                }
            };

            if let Some(reservation) = &expiry.released {
                if let Err(e) = self.ctx.ledger.release(reservation).await {
                    report.error(Some(&task.id), e);
                }
            }

            let (kind, verb) = match expiry.action {
                ExpiryAction::Requeued => {
                    report.requeued.push(task.id.clone());
                    (EventKind::TaskRequeued, "requeued")
                }
                ExpiryAction::Abandoned => {
                    report.abandoned.push(task.id.clone());
                    (EventKind::TaskAbandoned, "abandoned")
                }
            };
            warn!(
                "Task {} timed out after attempt {}, {}",
                task.id, expiry.task.attempt_count, verb
            );
            let detail = format!("no result within {:?} (attempt {})", self.config.max_assignment_age, expiry.task.attempt_count);
            self.ctx
                .record(Event::new(AgentId::dispatcher(), kind, detail, now).for_task(&task.id))
                .await;
        }
        Ok(())
    }

    /// Gate, reserve and assign one task. Returns the task when its worker
    /// still has to be notified.
    async fn stage(&self, task: Task, now: Time, report: &mut CycleReport) -> Option<Staged> {
        let attempt_no = task.attempt_count + 1;
        if attempt_no > self.config.max_attempts {
            self.abandon_exhausted(&task, now, report).await;
            return None;
        }

        let Some((worker, notifier)) = self.registry.route(&task.kind) else {
            debug!("No worker handles kind '{}', leaving task {} pending", task.kind, task.id);
            report.unroutable.push(task.id);
            return None;
        };
        let worker = worker.to_string();

        let reservation = self.reserve_for(&task, now, report).await.ok()?;

        let assignment = Assignment {
            attempt_no,
            at: now,
            reservation: reservation.clone(),
        };
        if let Err(e) = self.ctx.store.mark_assigned(&task.id, assignment).await {
            self.release_quietly(reservation.as_ref(), &task.id, report).await;
            match e {
                StoreError::NotPending { .. } => debug!("Task {} was taken by another dispatcher", task.id),
                e => report.error(Some(&task.id), e),
            }
            return None;
        }

        let notice = DispatchNotice::for_task(&task, attempt_no);
        Some(Staged { task, worker, notifier, notice })
    }

    /// Notify every staged worker at once, each bounded by `notify_timeout`,
    /// then settle the outcomes in scan order.
    async fn deliver(&self, staged: Vec<Staged>, now: Time, report: &mut CycleReport) {
        let timeout = self.config.notify_timeout;
        let deliveries = staged.iter().map(|entry| async move {
            match tokio::time::timeout(timeout, entry.notifier.notify(&entry.notice)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout),
            }
        });
        let outcomes = join_all(deliveries).await;

        for (entry, delivery) in staged.into_iter().zip(outcomes) {
            let Staged { task, worker, notice, .. } = entry;
            let attempt_no = notice.attempt;
            match delivery {
                Ok(()) => {
                    info!("Assigned task {} to {} (attempt {})", task.id, worker, attempt_no);
                    self.ctx.health.dispatched(&task.kind, now).await;
                    let detail = format!("worker {worker}, attempt {attempt_no}");
                    self.ctx
                        .record(Event::new(AgentId::dispatcher(), EventKind::TaskAssigned, detail, now).for_task(&task.id))
                        .await;
                    report.assigned.push(task.id);
                }
                Err(e) => {
                    warn!("Could not notify {} about task {}: {}", worker, task.id, e);
                    match self.ctx.store.revert_assignment(&task.id, attempt_no).await {
                        Ok((_, held)) => self.release_quietly(held.as_ref(), &task.id, report).await,
                        Err(e) => report.error(Some(&task.id), e),
                    }
                    let detail = format!("worker {worker}: {e}");
                    self.ctx
                        .record(Event::new(AgentId::dispatcher(), EventKind::NotifyFailed, detail, now).for_task(&task.id))
                        .await;
                    report.notify_failed.push(task.id);
                }
            }
        }
    }

    /// A pending task with no attempts left (e.g. `max_attempts` was lowered
    /// across a restart) is abandoned rather than skipped forever.
    async fn abandon_exhausted(&self, task: &Task, now: Time, report: &mut CycleReport) {
        match self.ctx.store.abandon_exhausted(&task.id, self.config.max_attempts, now).await {
            Ok(Some(abandoned)) => {
                warn!(
                    "Task {} already used {} of {} attempts, abandoned",
                    task.id, abandoned.attempt_count, self.config.max_attempts
                );
                let detail = format!("no attempts left ({} of {})", abandoned.attempt_count, self.config.max_attempts);
                self.ctx
                    .record(Event::new(AgentId::dispatcher(), EventKind::TaskAbandoned, detail, now).for_task(&task.id))
                    .await;
                report.abandoned.push(task.id.clone());
            }
            Ok(None) => debug!("Task {} changed before it could be abandoned", task.id),
            Err(e) => report.error(Some(&task.id), e),
        }
    }

    /// Gate and reserve capital for `task`. `Err(())` means the task was
    /// skipped and the report already says why.
    async fn reserve_for(&self, task: &Task, now: Time, report: &mut CycleReport) -> Result<Option<Reservation>, ()> {
        let Some(request) = &task.capital else {
            return Ok(None);
        };

        match self.ctx.ledger.dispatch_gate(&request.tier).await {
            Ok(DispatchGate::Open) => {}
            Ok(DispatchGate::Halted { by, status }) => {
                debug!("Task {} held: tier {} is {}", task.id, by, status);
                report.skipped_breaker.push(task.id.clone());
                return Err(());
            }
            Err(e) => {
                report.error(Some(&task.id), e);
                return Err(());
            }
        }

        match self.ctx.ledger.reserve(&request.tier, request.amount, Some(&task.id), now).await {
            Ok(reservation) => Ok(Some(reservation)),
            Err(e) if e.is_capacity() => {
                debug!("Task {} waits for capacity: {}", task.id, e);
                report.skipped_capacity.push(task.id.clone());
                Err(())
            }
            Err(e) => {
                report.error(Some(&task.id), e);
                Err(())
            }
        }
    }

    async fn release_quietly(&self, reservation: Option<&Reservation>, task_id: &TaskId, report: &mut CycleReport) {
        if let Some(reservation) = reservation {
            if let Err(e) = self.ctx.ledger.release(reservation).await {
                report.error(Some(task_id), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::WorkerHealth;
    use crate::ledger::BudgetLedger;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use constellation_core::{TaskKind, TierConfig, TierName};
    use constellation_storage::{Journal, MemoryStore, TaskStore};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: std::sync::Mutex<Vec<DispatchNotice>>,
    }

    #[async_trait]
    impl WorkerNotifier for RecordingNotifier {
        async fn notify(&self, notice: &DispatchNotice) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl WorkerNotifier for FailingNotifier {
        async fn notify(&self, _notice: &DispatchNotice) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected { status: 503, body: "down".into() })
        }
    }

    struct SlowNotifier;

    #[async_trait]
    impl WorkerNotifier for SlowNotifier {
        async fn notify(&self, _notice: &DispatchNotice) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(4)).await;
            Ok(())
        }
    }

    struct StuckNotifier;

    #[async_trait]
    impl WorkerNotifier for StuckNotifier {
        async fn notify(&self, _notice: &DispatchNotice) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<BudgetLedger>,
        dispatcher: Dispatcher,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(tiers: Vec<TierConfig>, config: DispatchConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(BudgetLedger::new(tiers));
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = WorkerRegistry::new()
            .with_worker("trader", [TaskKind::new("trade")], notifier.clone())
            .with_worker("broken", [TaskKind::new("broken")], Arc::new(FailingNotifier))
            .with_worker("stuck", [TaskKind::new("stuck")], Arc::new(StuckNotifier))
            .with_worker("slow", [TaskKind::new("slow")], Arc::new(SlowNotifier));
        let health = Arc::new(WorkerHealth::from_registry(&registry));
        let ctx = OrchestrationContext::new(store.clone(), store.clone(), ledger.clone()).with_health(health);
        let dispatcher = Dispatcher::new(ctx, registry).with_config(config);
        Harness { store, ledger, dispatcher, notifier }
    }

    fn ran(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Ran(report) => report,
            CycleOutcome::Overlapped => panic!("cycle overlapped"),
        }
    }

    #[tokio::test]
    async fn test_assigns_in_priority_order() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        let t0 = Utc::now() - ChronoDuration::minutes(5);
        h.store.enqueue(Task::new("low", "trade", 1, t0)).await.unwrap();
        h.store.enqueue(Task::new("high", "trade", 9, t0 + ChronoDuration::seconds(30))).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(Utc::now()).await.unwrap());
        assert_eq!(report.assigned, vec![TaskId::new("high"), TaskId::new("low")]);

        let seen = h.notifier.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].task_id, TaskId::new("high"));
        assert_eq!(seen[0].attempt, 1);

        let task = h.store.get(&TaskId::new("low")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_second_cycle_does_not_redispatch() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        h.store.enqueue(Task::new("a", "trade", 1, Utc::now())).await.unwrap();

        let now = Utc::now();
        ran(h.dispatcher.run_cycle(now).await.unwrap());
        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert!(report.assigned.is_empty());
        assert_eq!(h.notifier.seen.lock().unwrap().len(), 1);
        assert_eq!(h.dispatcher.cycles(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_capacity_skips_and_retries() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        let now = Utc::now();
        h.store.enqueue(Task::new("big", "trade", 5, now).with_capital("t", 8.0)).await.unwrap();
        h.store.enqueue(Task::new("also-big", "trade", 4, now).with_capital("t", 8.0)).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert_eq!(report.assigned, vec![TaskId::new("big")]);
        assert_eq!(report.skipped_capacity, vec![TaskId::new("also-big")]);
        assert!(report.errors.is_empty());

        let tier = h.ledger.tier_status(&TierName::new("t")).await.unwrap();
        assert_eq!(tier.allocated, 2.0);

        let skipped = h.store.get(&TaskId::new("also-big")).await.unwrap().unwrap();
        assert_eq!(skipped.state, TaskState::Pending);
        assert!(skipped.reservation.is_none());

        let assigned = h.store.get(&TaskId::new("big")).await.unwrap().unwrap();
        assert_eq!(assigned.reservation.as_ref().map(|r| r.amount), Some(8.0));
    }

    #[tokio::test]
    async fn test_notify_failure_reverts_and_releases() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        let now = Utc::now();
        h.store.enqueue(Task::new("x", "broken", 9, now).with_capital("t", 4.0)).await.unwrap();
        h.store.enqueue(Task::new("y", "trade", 1, now)).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert_eq!(report.notify_failed, vec![TaskId::new("x")]);
        assert_eq!(report.assigned, vec![TaskId::new("y")]);

        let task = h.store.get(&TaskId::new("x")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_notifier_times_out() {
        let config = DispatchConfig { notify_timeout: Duration::from_secs(5), ..Default::default() };
        let h = harness(vec![TierConfig::new("t", 10.0)], config);
        let now = Utc::now();
        h.store.enqueue(Task::new("s", "stuck", 1, now)).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert_eq!(report.notify_failed, vec![TaskId::new("s")]);
        let task = h.store.get(&TaskId::new("s")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_unroutable_stays_pending() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        h.store.enqueue(Task::new("w", "wrap", 1, Utc::now())).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(Utc::now()).await.unwrap());
        assert_eq!(report.unroutable, vec![TaskId::new("w")]);
        let task = h.store.get(&TaskId::new("w")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_unknown_tier_is_surfaced() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        h.store.enqueue(Task::new("q", "trade", 1, Utc::now()).with_capital("missing", 1.0)).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(Utc::now()).await.unwrap());
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0].error,
            DispatchError::Ledger(LedgerError::UnknownTier(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_requeues_then_abandons() {
        let config = DispatchConfig {
            max_attempts: 2,
            max_assignment_age: Duration::from_secs(60),
            ..Default::default()
        };
        let h = harness(vec![TierConfig::new("t", 10.0)], config);
        let t0 = Utc::now();
        h.store.enqueue(Task::new("slow", "trade", 1, t0).with_capital("t", 6.0)).await.unwrap();
        let tier = TierName::new("t");

        ran(h.dispatcher.run_cycle(t0).await.unwrap());
        assert_eq!(h.ledger.tier_status(&tier).await.unwrap().allocated, 4.0);

        // Past the deadline: reclaimed, reservation returned, and redispatched.
        let t1 = t0 + ChronoDuration::seconds(60);
        let report = ran(h.dispatcher.run_cycle(t1).await.unwrap());
        assert_eq!(report.requeued, vec![TaskId::new("slow")]);
        assert_eq!(report.assigned, vec![TaskId::new("slow")]);
        let task = h.store.get(&TaskId::new("slow")).await.unwrap().unwrap();
        assert_eq!(task.attempt_count, 2);
        assert_eq!(h.ledger.tier_status(&tier).await.unwrap().allocated, 4.0);

        let t2 = t1 + ChronoDuration::seconds(61);
        let report = ran(h.dispatcher.sweep(t2).await.unwrap());
        assert_eq!(report.abandoned, vec![TaskId::new("slow")]);
        let task = h.store.get(&TaskId::new("slow")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
        assert_eq!(h.ledger.tier_status(&tier).await.unwrap().allocated, 10.0);
        assert_eq!(h.ledger.tier_status(&tier).await.unwrap().open_reservations, 0);
    }

    #[tokio::test]
    async fn test_halt_all_blocks_capital_tasks_only() {
        let tiers = vec![TierConfig::new("t", 10.0).with_breakers(Some(0.3), None)];
        let h = harness(tiers, DispatchConfig::default());
        let now = Utc::now();
        let tier = TierName::new("t");

        let r = h.ledger.reserve(&tier, 5.0, None, now).await.unwrap();
        h.ledger.settle(&r, 0.0).await.unwrap();

        h.store.enqueue(Task::new("cap", "trade", 5, now).with_capital("t", 1.0)).await.unwrap();
        h.store.enqueue(Task::new("free", "trade", 1, now)).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert_eq!(report.skipped_breaker, vec![TaskId::new("cap")]);
        assert_eq!(report.assigned, vec![TaskId::new("free")]);
    }

    #[tokio::test]
    async fn test_dispatch_cap() {
        let config = DispatchConfig { max_dispatch_per_cycle: Some(1), ..Default::default() };
        let h = harness(vec![TierConfig::new("t", 10.0)], config);
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            h.store.enqueue(Task::new(id, "trade", 1, now)).await.unwrap();
        }
        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert_eq!(report.assigned.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_cycles_are_serialized() {
        let h = harness(vec![TierConfig::new("t", 10.0)], DispatchConfig::default());
        let now = Utc::now();
        for i in 0..20 {
            h.store.enqueue(Task::new(format!("t{i}"), "trade", 1, now)).await.unwrap();
        }

        let dispatcher = Arc::new(h.dispatcher);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move { d.run_cycle(now).await.unwrap() }));
        }

        let mut assigned = 0;
        for handle in handles {
            if let CycleOutcome::Ran(report) = handle.await.unwrap() {
                assigned += report.assigned.len();
            }
        }
        assert_eq!(assigned, 20);
        assert_eq!(h.notifier.seen.lock().unwrap().len(), 20);
        assert_eq!(h.store.stats().await.unwrap().assigned, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_are_notified_concurrently() {
        let config = DispatchConfig { notify_timeout: Duration::from_secs(5), ..Default::default() };
        let h = harness(vec![TierConfig::new("t", 10.0)], config);
        let now = Utc::now();
        for id in ["s1", "s2", "s3"] {
            h.store.enqueue(Task::new(id, "slow", 1, now)).await.unwrap();
        }

        let started = tokio::time::Instant::now();
        let report = ran(h.dispatcher.run_cycle(now).await.unwrap());
        assert_eq!(report.assigned.len(), 3);
        assert!(report.notify_failed.is_empty());
        // One notifier's worth of latency, not three.
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_pending_task_without_attempts_is_abandoned() {
        let config = DispatchConfig {
            max_attempts: 3,
            max_assignment_age: Duration::from_secs(60),
            ..Default::default()
        };
        let h = harness(vec![TierConfig::new("t", 10.0)], config);
        let t0 = Utc::now();
        h.store.enqueue(Task::new("old", "trade", 1, t0).with_capital("t", 2.0)).await.unwrap();
        ran(h.dispatcher.run_cycle(t0).await.unwrap());
        let t1 = t0 + ChronoDuration::seconds(60);
        let report = ran(h.dispatcher.sweep(t1).await.unwrap());
        assert_eq!(report.requeued, vec![TaskId::new("old")]);

        // Restarted with a lower attempt limit.
        let ctx = OrchestrationContext::new(h.store.clone(), h.store.clone(), h.ledger.clone());
        let registry = WorkerRegistry::new().with_worker("trader", [TaskKind::new("trade")], h.notifier.clone());
        let strict = Dispatcher::new(ctx, registry).with_config(DispatchConfig { max_attempts: 1, ..Default::default() });

        let report = ran(strict.run_cycle(t1).await.unwrap());
        assert_eq!(report.abandoned, vec![TaskId::new("old")]);
        assert!(report.assigned.is_empty());
        let task = h.store.get(&TaskId::new("old")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 10.0);
        assert_eq!(h.notifier.seen.lock().unwrap().len(), 1);

        let report = ran(strict.run_cycle(t1).await.unwrap());
        assert!(report.abandoned.is_empty());
        let events = h.store.list_events(None).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::TaskAbandoned).count(), 1);
    }

    #[tokio::test]
    async fn test_silent_worker_reported_once() {
        let config = DispatchConfig {
            max_assignment_age: Duration::from_secs(600),
            worker_silence: Duration::from_secs(120),
            ..Default::default()
        };
        let h = harness(vec![TierConfig::new("t", 10.0)], config);
        let t0 = Utc::now();
        h.store.enqueue(Task::new("quiet", "trade", 1, t0)).await.unwrap();

        let report = ran(h.dispatcher.run_cycle(t0).await.unwrap());
        assert!(report.silent_workers.is_empty());

        let t1 = t0 + ChronoDuration::seconds(121);
        let report = ran(h.dispatcher.run_cycle(t1).await.unwrap());
        assert_eq!(report.silent_workers, vec!["trader".to_string()]);
        let report = ran(h.dispatcher.run_cycle(t1 + ChronoDuration::seconds(10)).await.unwrap());
        assert!(report.silent_workers.is_empty());

        let events = h.store.list_events(None).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::WorkerSilent).count(), 1);
    }
}
