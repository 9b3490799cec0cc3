//! Task store and journal contracts.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use constellation_core::{
    Assignment, Event, LedgerSnapshot, Reservation, Task, TaskFilter, TaskId, TaskResult,
    TaskState, TaskStats, TerminalState, Time,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A task with this id already exists
    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    /// No task with this id
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Transition requires `pending`
    #[error("task {id} is not pending (state: {state})")]
    NotPending {
        /// Task
        id: TaskId,
        /// Actual state
        state: TaskState,
    },

    /// Transition requires `assigned`
    #[error("task {id} is not assigned (state: {state})")]
    NotAssigned {
        /// Task
        id: TaskId,
        /// Actual state
        state: TaskState,
    },

    /// Task already finished with a different terminal state
    #[error("task {id} already terminal as {existing}, refusing {requested}")]
    AlreadyTerminal {
        /// Task
        id: TaskId,
        /// Recorded state
        existing: TaskState,
        /// State the caller asked for
        requested: TaskState,
    },

    /// Another process holds the data directory
    #[error("data directory {0} is in use by another process")]
    Locked(PathBuf),

    /// Store was opened read-only
    #[error("store is read-only")]
    ReadOnly,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of a `mark_terminal` call.
#[derive(Debug, Clone)]
pub enum TerminalTransition {
    /// The task moved from `assigned` to the terminal state
    Applied(Task),
    /// The task was already in the requested terminal state
    Unchanged(Task),
}

impl TerminalTransition {
    /// Whether this call changed the task.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The task as it now stands.
    pub fn task(&self) -> &Task {
        match self {
            Self::Applied(t) | Self::Unchanged(t) => t,
        }
    }
}

/// What the timeout sweep did with an expired assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Returned to `pending`
    Requeued,
    /// Out of attempts, now `abandoned`
    Abandoned,
}

/// An expired assignment reclaimed by the sweep.
#[derive(Debug, Clone)]
pub struct Expiry {
    /// Task after the transition
    pub task: Task,
    /// Requeued or abandoned
    pub action: ExpiryAction,
    /// Reservation that was held and must be released
    pub released: Option<Reservation>,
}

/// Position in the dispatch order, used to resume an eligible scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleCursor {
    priority: i32,
    created_at: Time,
    id: TaskId,
}

impl EligibleCursor {
    /// Cursor positioned at `task`.
    pub fn at(task: &Task) -> Self {
        Self {
            priority: task.priority,
            created_at: task.created_at,
            id: task.id.clone(),
        }
    }

    /// Whether `task` sorts strictly after this position.
    pub fn precedes(&self, task: &Task) -> bool {
        task.priority
            .cmp(&self.priority)
            .reverse()
            .then_with(|| task.created_at.cmp(&self.created_at))
            .then_with(|| task.id.cmp(&self.id))
            .is_gt()
    }
}

/// Durable record of work items and their states.
///
/// Every mutating operation is atomic per task id: concurrent callers racing
/// on the same transition see exactly one winner.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task in `pending` state.
    ///
    /// Fails with [`StoreError::DuplicateId`] if the id is already present.
    async fn enqueue(&self, task: Task) -> Result<()>;

    /// Load a task by ID.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;

    /// The first pending task (created at or before `now`) after `after` in
    /// dispatch order. Reads current state on every call.
    async fn next_eligible(&self, now: Time, after: Option<&EligibleCursor>) -> Result<Option<Task>>;

    /// `pending -> assigned`.
    async fn mark_assigned(&self, id: &TaskId, assignment: Assignment) -> Result<Task>;

    /// Undo an assignment whose notification never reached a worker.
    ///
    /// Restores `pending`, rolls back the attempt counter and returns the
    /// reservation that was recorded.
    async fn revert_assignment(&self, id: &TaskId, attempt_no: u32) -> Result<(Task, Option<Reservation>)>;

    /// `assigned -> succeeded | failed | abandoned`. Idempotent for the same state.
    async fn mark_terminal(
        &self,
        id: &TaskId,
        state: TerminalState,
        result: Option<TaskResult>,
        at: Time,
    ) -> Result<TerminalTransition>;

    /// Reclaim an assignment older than `max_age`. Returns `None` if the task
    /// is no longer assigned or has not yet expired.
    async fn expire_assignment(
        &self,
        id: &TaskId,
        now: Time,
        max_age: Duration,
        max_attempts: u32,
    ) -> Result<Option<Expiry>>;

    /// `pending -> abandoned` for a task that already used `max_attempts`.
    /// Returns `None` if the task is not pending or still has attempts left.
    async fn abandon_exhausted(&self, id: &TaskId, max_attempts: u32, at: Time) -> Result<Option<Task>>;

    /// List tasks matching the filter, in dispatch order.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Counts per state.
    async fn stats(&self) -> Result<TaskStats>;

    /// Lazy, restartable scan of eligible tasks.
    fn list_eligible(&self, now: Time) -> EligibleTasks<'_>
    where
        Self: Sized,
    {
        EligibleTasks::new(self, now)
    }
}

/// Cursor over eligible tasks. Each step re-queries the store, so tasks
/// assigned elsewhere are skipped and newly enqueued ones are picked up if
/// they sort later than the current position.
pub struct EligibleTasks<'a> {
    store: &'a dyn TaskStore,
    now: Time,
    cursor: Option<EligibleCursor>,
}

impl<'a> EligibleTasks<'a> {
    /// Start a scan at the head of the dispatch order.
    pub fn new(store: &'a dyn TaskStore, now: Time) -> Self {
        Self { store, now, cursor: None }
    }

    /// Next eligible task, or `None` when the scan is exhausted.
    pub async fn next(&mut self) -> Result<Option<Task>> {
        let next = self.store.next_eligible(self.now, self.cursor.as_ref()).await?;
        if let Some(task) = &next {
            self.cursor = Some(EligibleCursor::at(task));
        }
        Ok(next)
    }

    /// Restart from the head.
    pub fn restart(&mut self) {
        self.cursor = None;
    }

    /// Drain the remaining tasks.
    pub async fn collect(mut self) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        while let Some(task) = self.next().await? {
            out.push(task);
        }
        Ok(out)
    }
}

/// Append-only event journal plus the persisted ledger image.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append an event.
    async fn append_event(&self, event: &Event) -> Result<()>;

    /// Events in chronological order; the most recent `limit` if given.
    async fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>>;

    /// Persist the ledger image.
    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> Result<()>;

    /// Load the last persisted ledger image.
    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>>;
}
