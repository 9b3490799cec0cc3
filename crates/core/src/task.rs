//! Task model - the unit of work moved through the queue.

use serde::{Deserialize, Serialize};

use crate::id::{TaskId, TierName};
use crate::result::TaskResult;
use crate::tier::Reservation;
use crate::Time;

/// Capability tag selecting which worker handles a task.
///
/// The set of kinds is open: workers declare what they handle at startup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    /// Create a kind tag.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Borrow the raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Capital a task needs reserved before it may be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalRequest {
    /// Tier the capital is drawn from
    pub tier: TierName,
    /// Amount to reserve
    pub amount: f64,
}

/// Task lifecycle state.
///
/// ```text
/// Pending -> Assigned -> { Succeeded | Failed | Abandoned }
///               |
///               +-> Pending (timeout with attempts left, or undeliverable notice)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for dispatch
    Pending,
    /// Handed to a worker, no result yet
    Assigned,
    /// Worker reported success
    Succeeded,
    /// Worker reported failure
    Failed,
    /// Gave up after exhausting attempts
    Abandoned,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Abandoned)
    }

    /// Every state, in lifecycle order.
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Assigned,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Abandoned,
    ];
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// The subset of states a task can finish in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// Worker reported success
    Succeeded,
    /// Worker reported failure
    Failed,
    /// Gave up
    Abandoned,
}

impl From<TerminalState> for TaskState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Succeeded => TaskState::Succeeded,
            TerminalState::Failed => TaskState::Failed,
            TerminalState::Abandoned => TaskState::Abandoned,
        }
    }
}

/// Task declaration as produced by external task producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDeclaration {
    /// Producer-chosen unique id
    pub id: TaskId,
    /// Worker capability
    pub kind: TaskKind,
    /// Opaque data for the worker
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Higher is dispatched first
    #[serde(default)]
    pub priority: i32,
    /// Declaration time; defaults to enqueue time
    #[serde(default)]
    pub created_at: Option<Time>,
    /// Capital to reserve before dispatch
    #[serde(default)]
    pub capital: Option<CapitalRequest>,
}

/// A unit of work tracked by the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Worker capability
    pub kind: TaskKind,

    /// Opaque worker data
    pub payload: serde_json::Value,

    /// Ordering hint, higher first
    pub priority: i32,

    /// Capital requirement, if the task consumes any
    pub capital: Option<CapitalRequest>,

    /// Current state
    pub state: TaskState,

    /// Assignment attempts so far
    pub attempt_count: u32,

    /// Reservation held while assigned
    pub reservation: Option<Reservation>,

    /// Outcome recorded on completion
    pub result: Option<TaskResult>,

    /// Creation timestamp
    pub created_at: Time,

    /// Last assignment timestamp
    pub assigned_at: Option<Time>,

    /// Terminal transition timestamp
    pub completed_at: Option<Time>,
}

impl Task {
    /// Build a pending task from a producer declaration.
    pub fn from_declaration(decl: TaskDeclaration, now: Time) -> Self {
        Self {
            id: decl.id,
            kind: decl.kind,
            payload: decl.payload,
            priority: decl.priority,
            capital: decl.capital,
            state: TaskState::Pending,
            attempt_count: 0,
            reservation: None,
            result: None,
            created_at: decl.created_at.unwrap_or(now),
            assigned_at: None,
            completed_at: None,
        }
    }

    /// Create a pending task with an empty payload.
    pub fn new(id: impl Into<TaskId>, kind: impl Into<TaskKind>, priority: i32, created_at: Time) -> Self {
        Self::from_declaration(
            TaskDeclaration {
                id: id.into(),
                kind: kind.into(),
                payload: serde_json::Value::Null,
                priority,
                created_at: Some(created_at),
                capital: None,
            },
            created_at,
        )
    }

    /// Attach a capital requirement.
    pub fn with_capital(mut self, tier: impl Into<TierName>, amount: f64) -> Self {
        self.capital = Some(CapitalRequest { tier: tier.into(), amount });
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Dispatch order: priority descending, then oldest first, then id.
    pub fn dispatch_order(&self, other: &Task) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Parameters of a `pending -> assigned` transition.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Attempt number being started (1-based)
    pub attempt_no: u32,
    /// Assignment time
    pub at: Time,
    /// Reservation taken for this attempt
    pub reservation: Option<Reservation>,
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by state
    pub state: Option<Vec<TaskState>>,

    /// Filter by kind
    pub kind: Option<TaskKind>,

    /// Filter by minimum priority
    pub min_priority: Option<i32>,
}

impl TaskFilter {
    /// Whether a task passes the filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(states) = &self.state {
            if !states.contains(&task.state) {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &task.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        true
    }
}

/// Task counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Total tasks
    pub total: usize,
    /// Pending tasks
    pub pending: usize,
    /// Assigned tasks
    pub assigned: usize,
    /// Succeeded tasks
    pub succeeded: usize,
    /// Failed tasks
    pub failed: usize,
    /// Abandoned tasks
    pub abandoned: usize,
}

impl TaskStats {
    /// Count one task.
    pub fn record(&mut self, state: TaskState) {
        self.total += 1;
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Assigned => self.assigned += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Abandoned => self.abandoned += 1,
        }
    }
}
