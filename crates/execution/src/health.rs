//! Worker liveness, derived from dispatches and results.
//!
//! A worker is *silent* when it has held an assignment for longer than the
//! silence threshold without reporting any result. The first report from a
//! silent worker marks it recovered.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use constellation_core::{Task, TaskKind, TaskState, Time};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::worker::WorkerRegistry;

/// Liveness view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Worker name
    pub name: String,
    /// Kinds routed to the worker, sorted
    pub kinds: Vec<TaskKind>,
    /// Most recent successful notification
    pub last_dispatch: Option<Time>,
    /// Most recent result from the worker
    pub last_result: Option<Time>,
    /// Oldest notification not followed by any result
    pub awaiting_since: Option<Time>,
    /// Whether the worker has been silent past the threshold
    pub silent: bool,
}

/// A worker entering or leaving the silent state.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHealthChange {
    /// Worker name
    pub worker: String,
    /// `true` when the worker went silent, `false` when it recovered
    pub silent: bool,
    /// Notification the worker has not answered (when going silent)
    pub awaiting_since: Option<Time>,
    /// When the change was observed
    pub at: Time,
}

#[derive(Debug, Default)]
struct Activity {
    kinds: Vec<TaskKind>,
    last_dispatch: Option<Time>,
    last_result: Option<Time>,
    awaiting_since: Option<Time>,
    alerted: bool,
}

/// Tracks per-worker activity.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    workers_by_kind: HashMap<TaskKind, String>,
    activity: Mutex<BTreeMap<String, Activity>>,
}

impl WorkerHealth {
    /// Track every worker in the registry.
    pub fn from_registry(registry: &WorkerRegistry) -> Self {
        let mut workers_by_kind = HashMap::new();
        let mut activity: BTreeMap<String, Activity> = BTreeMap::new();
        for (kind, name) in registry.routes() {
            workers_by_kind.insert(kind.clone(), name.to_string());
            activity.entry(name.to_string()).or_default().kinds.push(kind.clone());
        }
        for entry in activity.values_mut() {
            entry.kinds.sort();
        }
        Self {
            workers_by_kind,
            activity: Mutex::new(activity),
        }
    }

    /// Rebuild outstanding assignments from the task table after a restart.
    pub async fn seed(&self, tasks: &[Task]) {
        let mut activity = self.activity.lock().await;
        for task in tasks.iter().filter(|t| t.state == TaskState::Assigned) {
            let (Some(name), Some(at)) = (self.workers_by_kind.get(&task.kind), task.assigned_at) else {
                continue;
            };
            let Some(entry) = activity.get_mut(name) else { continue };
            entry.last_dispatch = entry.last_dispatch.max(Some(at));
            entry.awaiting_since = Some(entry.awaiting_since.map_or(at, |since| since.min(at)));
        }
    }

    /// A notice for `kind` was delivered.
    pub async fn dispatched(&self, kind: &TaskKind, at: Time) {
        let Some(name) = self.workers_by_kind.get(kind) else { return };
        let mut activity = self.activity.lock().await;
        if let Some(entry) = activity.get_mut(name) {
            entry.last_dispatch = Some(at);
            entry.awaiting_since.get_or_insert(at);
        }
    }

    /// The worker for `kind` reported a result. Returns the recovery if the
    /// worker had been reported silent.
    pub async fn reported(&self, kind: &TaskKind, at: Time) -> Option<WorkerHealthChange> {
        let name = self.workers_by_kind.get(kind)?;
        let mut activity = self.activity.lock().await;
        let entry = activity.get_mut(name)?;
        entry.last_result = Some(at);
        entry.awaiting_since = None;
        if !entry.alerted {
            return None;
        }
        entry.alerted = false;
        Some(WorkerHealthChange {
            worker: name.clone(),
            silent: false,
            awaiting_since: None,
            at,
        })
    }

    /// Workers that crossed the silence threshold since the last check.
    pub async fn check(&self, now: Time, threshold: Duration) -> Vec<WorkerHealthChange> {
        let mut activity = self.activity.lock().await;
        let mut changes = Vec::new();
        for (name, entry) in activity.iter_mut() {
            if entry.alerted || !is_silent(entry, now, threshold) {
                continue;
            }
            entry.alerted = true;
            changes.push(WorkerHealthChange {
                worker: name.clone(),
                silent: true,
                awaiting_since: entry.awaiting_since,
                at: now,
            });
        }
        changes
    }

    /// Status of every tracked worker, by name.
    pub async fn status(&self, now: Time, threshold: Duration) -> Vec<WorkerStatus> {
        let activity = self.activity.lock().await;
        activity
            .iter()
            .map(|(name, entry)| WorkerStatus {
                name: name.clone(),
                kinds: entry.kinds.clone(),
                last_dispatch: entry.last_dispatch,
                last_result: entry.last_result,
                awaiting_since: entry.awaiting_since,
                silent: is_silent(entry, now, threshold),
            })
            .collect()
    }
}

fn is_silent(entry: &Activity, now: Time, threshold: Duration) -> bool {
    let Some(since) = entry.awaiting_since else {
        return false;
    };
    chrono::Duration::from_std(threshold).is_ok_and(|threshold| now.signed_duration_since(since) > threshold)
}
