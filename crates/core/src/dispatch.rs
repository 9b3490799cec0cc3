//! Dispatch notice sent to workers.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::task::{Task, TaskKind};

/// Minimal record a worker receives when a task is assigned to it.
///
/// Workers may see the same `task_id` more than once (`attempt` > 1 after a
/// timeout) and must handle repeated delivery idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchNotice {
    /// Task id
    pub task_id: TaskId,
    /// Capability tag
    pub kind: TaskKind,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Attempt number (1-based)
    pub attempt: u32,
}

impl DispatchNotice {
    /// Notice for the given task and attempt.
    pub fn for_task(task: &Task, attempt: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            attempt,
        }
    }

    /// Serializes the notice to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
