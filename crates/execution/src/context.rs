//! Shared handles used by the dispatcher and the collector.

use std::sync::Arc;

use constellation_core::{AgentId, Event, EventKind, Time};
use constellation_storage::{Journal, StoreError, TaskStore};
use tracing::warn;

use crate::alert::{AlertSink, LogAlertSink};
use crate::health::{WorkerHealth, WorkerHealthChange};
use crate::ledger::{BreakerChange, BudgetLedger};

/// Everything that holds mutable shared state, behind cheap clones.
#[derive(Clone)]
pub struct OrchestrationContext {
    /// Task store
    pub store: Arc<dyn TaskStore>,

    /// Event journal and ledger persistence
    pub journal: Arc<dyn Journal>,

    /// Budget ledger
    pub ledger: Arc<BudgetLedger>,

    /// Alert channel
    pub alerts: Arc<dyn AlertSink>,

    /// Worker liveness
    pub health: Arc<WorkerHealth>,
}

impl OrchestrationContext {
    /// Bundle the shared state, alerting through the log.
    pub fn new(store: Arc<dyn TaskStore>, journal: Arc<dyn Journal>, ledger: Arc<BudgetLedger>) -> Self {
        Self {
            store,
            journal,
            ledger,
            alerts: Arc::new(LogAlertSink),
            health: Arc::new(WorkerHealth::default()),
        }
    }

    /// Set the alert sink.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Set the worker liveness tracker.
    pub fn with_health(mut self, health: Arc<WorkerHealth>) -> Self {
        self.health = health;
        self
    }

    /// Append to the journal. A failing journal is logged, never fatal.
    pub async fn record(&self, event: Event) {
        if let Err(e) = self.journal.append_event(&event).await {
            warn!("Failed to journal {:?} event: {}", event.kind, e);
        }
    }

    /// Forward pending breaker transitions to the alert sink and journal.
    pub async fn publish_breaker_changes(&self, actor: AgentId, now: Time) -> Vec<BreakerChange> {
        let changes = self.ledger.take_breaker_changes().await;
        for change in &changes {
            self.alerts.breaker_changed(change).await;
            let detail = format!(
                "{} -> {} (drawdown {:.4} from initial, {:.4} from peak)",
                change.from, change.to, change.drawdown_from_initial, change.drawdown_from_peak
            );
            self.record(Event::new(actor.clone(), EventKind::BreakerChanged, detail, now).for_tier(&change.tier))
                .await;
        }
        changes
    }

    /// Forward worker liveness changes to the alert sink and journal.
    pub async fn publish_worker_changes(&self, changes: &[WorkerHealthChange], actor: AgentId) {
        for change in changes {
            self.alerts.worker_health_changed(change).await;
            let (kind, detail) = if change.silent {
                let since = change.awaiting_since.map(|t| t.to_rfc3339()).unwrap_or_default();
                (EventKind::WorkerSilent, format!("worker {} silent since {since}", change.worker))
            } else {
                (EventKind::WorkerRecovered, format!("worker {} reporting again", change.worker))
            };
            self.record(Event::new(actor.clone(), kind, detail, change.at)).await;
        }
    }

    /// Persist the current ledger image.
    pub async fn persist_ledger(&self, now: Time) -> Result<(), StoreError> {
        let snapshot = self.ledger.snapshot(now).await;
        self.journal.save_ledger(&snapshot).await
    }
}
