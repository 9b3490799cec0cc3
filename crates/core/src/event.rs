//! Event model - entries of the orchestration journal.

use crate::id::{AgentId, EventId, TaskId, TierName};
use crate::Time;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Task accepted by the store
    TaskEnqueued,
    /// Task handed to a worker
    TaskAssigned,
    /// Worker could not be notified; assignment reverted
    NotifyFailed,
    /// Assignment timed out, task returned to pending
    TaskRequeued,
    /// Assignment timed out with no attempts left
    TaskAbandoned,
    /// Worker result recorded
    ResultIngested,
    /// Result arrived for a task that is no longer assigned
    LateResultIgnored,
    /// Breaker status of a tier changed
    BreakerChanged,
    /// Operator reset a tier
    TierReset,
    /// Worker stopped answering its assignments
    WorkerSilent,
    /// Silent worker reported again
    WorkerRecovered,
    /// Inbox submission could not be applied
    SubmissionRejected,
}

/// An event is an atomic unit that happened at a specific time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier
    pub id: EventId,

    /// When it happened
    pub timestamp: Time,

    /// Who performed the action
    pub actor: AgentId,

    /// What happened
    pub kind: EventKind,

    /// Human-readable summary
    pub detail: String,

    /// Related task
    pub task_id: Option<TaskId>,

    /// Related tier
    pub tier: Option<TierName>,
}

impl Event {
    /// Create a new event.
    pub fn new(actor: AgentId, kind: EventKind, detail: impl Into<String>, timestamp: Time) -> Self {
        Self {
            id: EventId::new(),
            timestamp,
            actor,
            kind,
            detail: detail.into(),
            task_id: None,
            tier: None,
        }
    }

    /// Relate the event to a task.
    pub fn for_task(mut self, id: &TaskId) -> Self {
        self.task_id = Some(id.clone());
        self
    }

    /// Relate the event to a tier.
    pub fn for_tier(mut self, tier: &TierName) -> Self {
        self.tier = Some(tier.clone());
        self
    }
}
