//! Result collector - applies worker-reported outcomes to the store and ledger.

use chrono::Utc;
use constellation_core::{AgentId, Event, EventKind, Task, TaskId, TaskResult, TaskState, Time};
use constellation_storage::{StoreError, TerminalTransition};
use tracing::{debug, info, warn};

use crate::context::OrchestrationContext;
use crate::ledger::{LedgerError, Settlement};

/// Errors from ingesting a result.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// No task with the reported id
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// Task store rejected the transition
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Ledger rejected the settlement
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// What an ingestion did.
#[derive(Debug)]
pub enum IngestOutcome {
    /// The task reached its terminal state
    Recorded {
        /// Task after the transition
        task: Task,
        /// Ledger effect, if the task held a reservation
        settlement: Option<Settlement>,
    },
    /// The task was not assigned any more; nothing changed
    Ignored {
        /// Reported task
        task_id: TaskId,
        /// State the task was found in
        state: TaskState,
    },
}

impl IngestOutcome {
    /// Whether the result took effect.
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// Ingests [`TaskResult`]s.
///
/// Only the first result against an `assigned` task has effect. Results for
/// tasks that were already finished, reclaimed by the timeout sweep or
/// abandoned are logged and dropped.
#[derive(Clone)]
pub struct ResultCollector {
    ctx: OrchestrationContext,
}

impl ResultCollector {
    /// Create a collector over the shared state.
    pub fn new(ctx: OrchestrationContext) -> Self {
        Self { ctx }
    }

    /// Ingest a result, timestamped now.
    pub async fn ingest(&self, result: TaskResult) -> Result<IngestOutcome, CollectError> {
        self.ingest_at(result, Utc::now()).await
    }

    /// Ingest a result as of `now`.
    ///
    /// A result whose `capital_delta` is not finite is refused before
    /// anything changes.
    pub async fn ingest_at(&self, result: TaskResult, now: Time) -> Result<IngestOutcome, CollectError> {
        if !result.capital_delta.is_finite() {
            return Err(LedgerError::InvalidAmount(result.capital_delta).into());
        }

        let task = self
            .ctx
            .store
            .get(&result.task_id)
            .await?
            .ok_or_else(|| CollectError::UnknownTask(result.task_id.clone()))?;

        if let Some(change) = self.ctx.health.reported(&task.kind, now).await {
            self.ctx.publish_worker_changes(&[change], AgentId::collector()).await;
        }

        if task.state != TaskState::Assigned {
            return Ok(self.ignore(&result, task.state, now).await);
        }

        // Settlement must be possible before the task is made terminal.
        let settle_against = match &task.reservation {
            Some(reservation) => {
                if self.ctx.ledger.is_open(reservation.id).await {
                    Some(reservation.id)
                } else {
                    warn!(
                        "Reservation {} of task {} is no longer open, recording result without settlement",
                        reservation.id, task.id
                    );
                    None
                }
            }
            None => None,
        };

        let terminal = result.outcome.terminal_state();
        let transition = match self
            .ctx
            .store
            .mark_terminal(&task.id, terminal, Some(result.clone()), now)
            .await
        {
            Ok(transition) => transition,
            // The sweep reclaimed it between the read and the write.
            Err(StoreError::NotAssigned { state, .. }) => return Ok(self.ignore(&result, state, now).await),
            Err(e) => return Err(e.into()),
        };

        let task = match transition {
            TerminalTransition::Applied(task) => task,
            TerminalTransition::Unchanged(task) => {
                let state = task.state;
                return Ok(self.ignore(&result, state, now).await);
            }
        };

        let settlement = match &task.reservation {
            Some(reservation) if settle_against == Some(reservation.id) => {
                Some(self.ctx.ledger.settle(reservation, result.capital_delta).await?)
            }
            Some(_) => None,
            None => {
                if result.capital_delta != 0.0 {
                    warn!(
                        "Task {} holds no capital, dropping reported delta {:+}",
                        task.id, result.capital_delta
                    );
                }
                None
            }
        };

        info!("Task {} finished as {} (delta {:+})", task.id, task.state, result.capital_delta);
        let detail = format!("{} with delta {:+}", task.state, result.capital_delta);
        self.ctx
            .record(Event::new(AgentId::collector(), EventKind::ResultIngested, detail, now).for_task(&task.id))
            .await;

        self.ctx.publish_breaker_changes(AgentId::collector(), now).await;
        if let Err(e) = self.ctx.persist_ledger(now).await {
            warn!("Failed to persist ledger after settling task {}: {}", task.id, e);
        }

        Ok(IngestOutcome::Recorded { task, settlement })
    }

    async fn ignore(&self, result: &TaskResult, state: TaskState, now: Time) -> IngestOutcome {
        info!(
            "Ignoring {:?} result for task {}: task is {}",
            result.outcome, result.task_id, state
        );
        let detail = format!("{:?} result while {}", result.outcome, state);
        self.ctx
            .record(
                Event::new(AgentId::collector(), EventKind::LateResultIgnored, detail, now).for_task(&result.task_id),
            )
            .await;
        debug!("Late result detail: {}", result.detail);
        IngestOutcome::Ignored {
            task_id: result.task_id.clone(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BudgetLedger;
    use chrono::Duration as ChronoDuration;
    use constellation_core::{Assignment, TierConfig, TierName};
    use constellation_storage::{ExpiryAction, Journal, MemoryStore, TaskStore};
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<BudgetLedger>,
        collector: ResultCollector,
    }

    fn harness(tiers: Vec<TierConfig>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(BudgetLedger::new(tiers));
        let ctx = OrchestrationContext::new(store.clone(), store.clone(), ledger.clone());
        Harness {
            store,
            ledger,
            collector: ResultCollector::new(ctx),
        }
    }

    /// Enqueue and assign a task the way the dispatcher would.
    async fn assign(h: &Harness, task: Task, now: Time) -> Task {
        let reservation = match &task.capital {
            Some(c) => Some(h.ledger.reserve(&c.tier, c.amount, Some(&task.id), now).await.unwrap()),
            None => None,
        };
        let id = task.id.clone();
        h.store.enqueue(task).await.unwrap();
        h.store
            .mark_assigned(&id, Assignment { attempt_no: 1, at: now, reservation })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_settles_reservation() {
        let h = harness(vec![TierConfig::new("t", 40.0)]);
        let now = Utc::now();
        assign(&h, Task::new("a", "trade", 1, now).with_capital("t", 10.0), now).await;

        let outcome = h.collector.ingest_at(TaskResult::success("a", 2.0), now).await.unwrap();
        let IngestOutcome::Recorded { task, settlement } = outcome else {
            panic!("expected recorded");
        };
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.result.as_ref().map(|r| r.capital_delta), Some(2.0));
        assert_eq!(settlement.map(|s| s.allocated), Some(32.0));

        let status = h.ledger.tier_status(&TierName::new("t")).await.unwrap();
        assert_eq!(status.allocated, 32.0);
        assert_eq!(status.open_reservations, 0);
    }

    #[tokio::test]
    async fn test_failure_records_failed_state() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let now = Utc::now();
        assign(&h, Task::new("f", "trade", 1, now).with_capital("t", 4.0), now).await;

        let outcome = h.collector.ingest_at(TaskResult::failure("f", -1.0), now).await.unwrap();
        assert!(outcome.is_recorded());
        let task = h.store.get(&TaskId::new("f")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 5.0);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let err = h.collector.ingest(TaskResult::success("ghost", 0.0)).await.unwrap_err();
        assert!(matches!(err, CollectError::UnknownTask(id) if id.as_str() == "ghost"));
    }

    #[tokio::test]
    async fn test_duplicate_result_has_no_effect() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let now = Utc::now();
        assign(&h, Task::new("d", "trade", 1, now).with_capital("t", 5.0), now).await;

        h.collector.ingest_at(TaskResult::success("d", 1.0), now).await.unwrap();
        let second = h.collector.ingest_at(TaskResult::success("d", 1.0), now).await.unwrap();
        assert!(matches!(second, IngestOutcome::Ignored { state: TaskState::Succeeded, .. }));

        let conflicting = h.collector.ingest_at(TaskResult::failure("d", -3.0), now).await.unwrap();
        assert!(!conflicting.is_recorded());
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 6.0);
    }

    #[tokio::test]
    async fn test_late_result_after_abandon_is_ignored() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let t0 = Utc::now();
        assign(&h, Task::new("late", "trade", 1, t0).with_capital("t", 3.0), t0).await;

        let t1 = t0 + ChronoDuration::hours(2);
        let expiry = h
            .store
            .expire_assignment(&TaskId::new("late"), t1, Duration::from_secs(3600), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expiry.action, ExpiryAction::Abandoned);
        h.ledger.release(expiry.released.as_ref().unwrap()).await.unwrap();

        let before = h.ledger.tier_status(&TierName::new("t")).await.unwrap();
        let outcome = h.collector.ingest_at(TaskResult::success("late", 7.0), t1).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored { state: TaskState::Abandoned, .. }));

        let after = h.ledger.tier_status(&TierName::new("t")).await.unwrap();
        assert_eq!(before.allocated, after.allocated);
        let task = h.store.get(&TaskId::new("late")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
        assert!(task.result.is_none());

        let events = h.store.list_events(None).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::LateResultIgnored));
    }

    #[tokio::test]
    async fn test_delta_without_capital_is_dropped() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let now = Utc::now();
        assign(&h, Task::new("n", "wrap", 1, now), now).await;

        let outcome = h.collector.ingest_at(TaskResult::success("n", 5.0), now).await.unwrap();
        let IngestOutcome::Recorded { settlement, .. } = outcome else {
            panic!("expected recorded");
        };
        assert!(settlement.is_none());
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 10.0);
    }

    #[tokio::test]
    async fn test_settlement_sequence_trips_breaker() {
        let tiers = vec![TierConfig::new("t", 40.0).with_breakers(Some(0.5), Some(0.3))];
        let h = harness(tiers);
        let now = Utc::now();
        let tier = TierName::new("t");

        // 40 -> reserve 10 -> 30 -> +2 -> 32
        assign(&h, Task::new("one", "trade", 1, now).with_capital("t", 10.0), now).await;
        h.collector.ingest_at(TaskResult::success("one", 2.0), now).await.unwrap();
        assert_eq!(h.ledger.tier_status(&tier).await.unwrap().allocated, 32.0);

        // 32 -> reserve 10 -> 22 -> -10 -> 12
        assign(&h, Task::new("two", "trade", 1, now).with_capital("t", 10.0), now).await;
        h.collector.ingest_at(TaskResult::failure("two", -10.0), now).await.unwrap();
        let status = h.ledger.tier_status(&tier).await.unwrap();
        assert_eq!(status.allocated, 12.0);
        assert_eq!(status.breaker_status, constellation_core::BreakerStatus::HaltAll);

        let events = h.store.list_events(None).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::BreakerChanged));
        assert!(h.store.load_ledger().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_finite_delta_changes_nothing() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let now = Utc::now();
        assign(&h, Task::new("nan", "trade", 1, now).with_capital("t", 4.0), now).await;

        for delta in [f64::NAN, f64::INFINITY] {
            let err = h.collector.ingest_at(TaskResult::success("nan", delta), now).await.unwrap_err();
            assert!(matches!(err, CollectError::Ledger(LedgerError::InvalidAmount(_))));
        }

        let task = h.store.get(&TaskId::new("nan")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        let status = h.ledger.tier_status(&TierName::new("t")).await.unwrap();
        assert_eq!(status.open_reservations, 1);

        // The worker can still report a usable result.
        let outcome = h.collector.ingest_at(TaskResult::success("nan", 1.0), now).await.unwrap();
        assert!(outcome.is_recorded());
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 7.0);
    }

    #[tokio::test]
    async fn test_closed_reservation_records_without_settling() {
        let h = harness(vec![TierConfig::new("t", 10.0)]);
        let now = Utc::now();
        let task = assign(&h, Task::new("gone", "trade", 1, now).with_capital("t", 4.0), now).await;
        h.ledger.release(task.reservation.as_ref().unwrap()).await.unwrap();

        let outcome = h.collector.ingest_at(TaskResult::success("gone", 3.0), now).await.unwrap();
        let IngestOutcome::Recorded { task, settlement } = outcome else {
            panic!("expected recorded");
        };
        assert_eq!(task.state, TaskState::Succeeded);
        assert!(settlement.is_none());
        assert_eq!(h.ledger.tier_status(&TierName::new("t")).await.unwrap().allocated, 10.0);
    }
}
