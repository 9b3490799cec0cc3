//! In-memory task table holding the transition rules.
//!
//! Every transition is planned against the current row and returns the new
//! row without applying it, so a durable backend can persist first and
//! commit with [`TaskTable::put`] afterwards.

use std::collections::HashMap;
use std::time::Duration;

use constellation_core::{
    Assignment, Reservation, Task, TaskFilter, TaskId, TaskResult, TaskState, TaskStats,
    TerminalState, Time,
};

use crate::trait_::{EligibleCursor, Expiry, ExpiryAction, StoreError, Result};

/// Outcome of planning a terminal transition.
#[derive(Debug)]
pub(crate) enum TerminalPlan {
    /// New row to persist
    Apply(Task),
    /// Row already in the requested state
    Unchanged(Task),
}

#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: HashMap<TaskId, Task>,
}

impl TaskTable {
    pub(crate) fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub(crate) fn put(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    fn require(&self, id: &TaskId) -> Result<&Task> {
        self.tasks.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub(crate) fn plan_enqueue(&self, mut task: Task) -> Result<Task> {
        if self.tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateId(task.id));
        }
        task.state = TaskState::Pending;
        task.attempt_count = 0;
        task.reservation = None;
        task.result = None;
        task.assigned_at = None;
        task.completed_at = None;
        Ok(task)
    }

    pub(crate) fn next_eligible(&self, now: Time, after: Option<&EligibleCursor>) -> Option<Task> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending && t.created_at <= now)
            .filter(|t| after.map_or(true, |c| c.precedes(t)))
            .min_by(|a, b| a.dispatch_order(b))
            .cloned()
    }

    pub(crate) fn plan_assign(&self, id: &TaskId, assignment: Assignment) -> Result<Task> {
        let current = self.require(id)?;
        if current.state != TaskState::Pending {
            return Err(StoreError::NotPending { id: id.clone(), state: current.state });
        }
        let mut task = current.clone();
        task.state = TaskState::Assigned;
        task.attempt_count = assignment.attempt_no;
        task.assigned_at = Some(assignment.at.max(task.created_at));
        task.reservation = assignment.reservation;
        Ok(task)
    }

    pub(crate) fn plan_revert(&self, id: &TaskId, attempt_no: u32) -> Result<(Task, Option<Reservation>)> {
        let current = self.require(id)?;
        if current.state != TaskState::Assigned || current.attempt_count != attempt_no {
            return Err(StoreError::NotAssigned { id: id.clone(), state: current.state });
        }
        let mut task = current.clone();
        let reservation = task.reservation.take();
        task.state = TaskState::Pending;
        task.attempt_count = attempt_no.saturating_sub(1);
        task.assigned_at = None;
        Ok((task, reservation))
    }

    pub(crate) fn plan_terminal(
        &self,
        id: &TaskId,
        state: TerminalState,
        result: Option<TaskResult>,
        at: Time,
    ) -> Result<TerminalPlan> {
        let current = self.require(id)?;
        let requested = TaskState::from(state);

        if current.state.is_terminal() {
            if current.state == requested {
                return Ok(TerminalPlan::Unchanged(current.clone()));
            }
            return Err(StoreError::AlreadyTerminal {
                id: id.clone(),
                existing: current.state,
                requested,
            });
        }
        if current.state != TaskState::Assigned {
            return Err(StoreError::NotAssigned { id: id.clone(), state: current.state });
        }

        let mut task = current.clone();
        let floor = task.assigned_at.unwrap_or(task.created_at);
        task.state = requested;
        task.result = result;
        task.completed_at = Some(at.max(floor));
        Ok(TerminalPlan::Apply(task))
    }

    pub(crate) fn plan_expiry(
        &self,
        id: &TaskId,
        now: Time,
        max_age: Duration,
        max_attempts: u32,
    ) -> Result<Option<Expiry>> {
        let current = self.require(id)?;
        if current.state != TaskState::Assigned || !is_expired(current, now, max_age) {
            return Ok(None);
        }

        let mut task = current.clone();
        let released = task.reservation.take();
        let action = if task.attempt_count < max_attempts {
            task.state = TaskState::Pending;
            task.assigned_at = None;
            ExpiryAction::Requeued
        } else {
            task.state = TaskState::Abandoned;
            task.completed_at = Some(now.max(task.assigned_at.unwrap_or(task.created_at)));
            ExpiryAction::Abandoned
        };

        Ok(Some(Expiry { task, action, released }))
    }

    pub(crate) fn plan_abandon_exhausted(&self, id: &TaskId, max_attempts: u32, at: Time) -> Result<Option<Task>> {
        let current = self.require(id)?;
        if current.state != TaskState::Pending || current.attempt_count < max_attempts {
            return Ok(None);
        }
        let mut task = current.clone();
        task.state = TaskState::Abandoned;
        task.completed_at = Some(at.max(task.created_at));
        Ok(Some(task))
    }

    pub(crate) fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        tasks.sort_by(|a, b| a.dispatch_order(b));
        tasks
    }

    pub(crate) fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.tasks.values() {
            stats.record(task.state);
        }
        stats
    }
}

/// Whether an assignment is at least `max_age` old at `now`.
pub(crate) fn is_expired(task: &Task, now: Time, max_age: Duration) -> bool {
    let Some(assigned_at) = task.assigned_at else {
        return false;
    };
    match chrono::Duration::from_std(max_age) {
        Ok(age) => assigned_at + age <= now,
        Err(_) => false,
    }
}
