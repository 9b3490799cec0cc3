//! Worker-reported results.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::task::TerminalState;

/// Outcome a worker reports for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Work completed
    Success,
    /// Work attempted and failed
    Failure,
}

impl Outcome {
    /// Terminal state this outcome moves a task into.
    pub fn terminal_state(self) -> TerminalState {
        match self {
            Self::Success => TerminalState::Succeeded,
            Self::Failure => TerminalState::Failed,
        }
    }
}

/// Result record as reported by a worker.
///
/// ```json
/// {"task_id": "t-1", "outcome": "success", "detail": {"fills": 3}, "capital_delta": 2.5}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task the result belongs to
    pub task_id: TaskId,

    /// Success or failure
    pub outcome: Outcome,

    /// Free-form structured detail
    #[serde(default)]
    pub detail: serde_json::Value,

    /// Signed amount applied to the originating tier on settlement
    #[serde(default)]
    pub capital_delta: f64,
}

impl TaskResult {
    /// A success result with no detail.
    pub fn success(task_id: impl Into<TaskId>, capital_delta: f64) -> Self {
        Self {
            task_id: task_id.into(),
            outcome: Outcome::Success,
            detail: serde_json::Value::Null,
            capital_delta,
        }
    }

    /// A failure result with no detail.
    pub fn failure(task_id: impl Into<TaskId>, capital_delta: f64) -> Self {
        Self {
            task_id: task_id.into(),
            outcome: Outcome::Failure,
            detail: serde_json::Value::Null,
            capital_delta,
        }
    }

    /// Attach structured detail.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}
