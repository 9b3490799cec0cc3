//! In-memory storage backend, for tests and ephemeral runs.

use std::time::Duration;

use async_trait::async_trait;
use constellation_core::{
    Assignment, Event, LedgerSnapshot, Reservation, Task, TaskFilter, TaskId, TaskResult,
    TaskStats, TerminalState, Time,
};
use tokio::sync::Mutex;

use crate::table::{TaskTable, TerminalPlan};
use crate::trait_::{EligibleCursor, Expiry, Journal, Result, TaskStore, TerminalTransition};

/// Non-durable task store and journal.
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<TaskTable>,
    events: Mutex<Vec<Event>>,
    ledger: Mutex<Option<LedgerSnapshot>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let mut table = self.table.lock().await;
        let task = table.plan_enqueue(task)?;
        table.put(task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.table.lock().await.get(id).cloned())
    }

    async fn next_eligible(&self, now: Time, after: Option<&EligibleCursor>) -> Result<Option<Task>> {
        Ok(self.table.lock().await.next_eligible(now, after))
    }

    async fn mark_assigned(&self, id: &TaskId, assignment: Assignment) -> Result<Task> {
        let mut table = self.table.lock().await;
        let task = table.plan_assign(id, assignment)?;
        table.put(task.clone());
        Ok(task)
    }

    async fn revert_assignment(&self, id: &TaskId, attempt_no: u32) -> Result<(Task, Option<Reservation>)> {
        let mut table = self.table.lock().await;
        let (task, reservation) = table.plan_revert(id, attempt_no)?;
        table.put(task.clone());
        Ok((task, reservation))
    }

    async fn mark_terminal(
        &self,
        id: &TaskId,
        state: TerminalState,
        result: Option<TaskResult>,
        at: Time,
    ) -> Result<TerminalTransition> {
        let mut table = self.table.lock().await;
        match table.plan_terminal(id, state, result, at)? {
            TerminalPlan::Apply(task) => {
                table.put(task.clone());
                Ok(TerminalTransition::Applied(task))
            }
            TerminalPlan::Unchanged(task) => Ok(TerminalTransition::Unchanged(task)),
        }
    }

    async fn expire_assignment(
        &self,
        id: &TaskId,
        now: Time,
        max_age: Duration,
        max_attempts: u32,
    ) -> Result<Option<Expiry>> {
        let mut table = self.table.lock().await;
        let expiry = table.plan_expiry(id, now, max_age, max_attempts)?;
        if let Some(expiry) = &expiry {
            table.put(expiry.task.clone());
        }
        Ok(expiry)
    }

    async fn abandon_exhausted(&self, id: &TaskId, max_attempts: u32, at: Time) -> Result<Option<Task>> {
        let mut table = self.table.lock().await;
        let task = table.plan_abandon_exhausted(id, max_attempts, at)?;
        if let Some(task) = &task {
            table.put(task.clone());
        }
        Ok(task)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.table.lock().await.list(filter))
    }

    async fn stats(&self) -> Result<TaskStats> {
        Ok(self.table.lock().await.stats())
    }
}

#[async_trait]
impl Journal for MemoryStore {
    async fn append_event(&self, event: &Event) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        let events = self.events.lock().await;
        let skip = limit.map_or(0, |n| events.len().saturating_sub(n));
        Ok(events[skip..].to_vec())
    }

    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        *self.ledger.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.ledger.lock().await.clone())
    }
}
