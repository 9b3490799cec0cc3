//! JSON file storage implementation.
//!
//! Layout under the root directory:
//!
//! ```text
//! .lock             held exclusively by the writing process
//! tasks/<id>.json   one file per task, rewritten on every transition
//! ledger.json       last ledger snapshot
//! events.jsonl      append-only journal, one event per line
//! inbox/            submissions for the writing process, see `Inbox`
//! ```
//!
//! Tasks are indexed in memory at open; every mutation is written to disk
//! before it becomes visible in the index. Only one process may open the
//! directory for writing; others open it read-only or submit through the
//! inbox.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use constellation_core::{
    Assignment, Event, LedgerSnapshot, Reservation, Task, TaskFilter, TaskId, TaskResult,
    TaskStats, TerminalState, Time,
};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::table::{TaskTable, TerminalPlan};
use crate::trait_::{EligibleCursor, Expiry, Journal, Result, StoreError, TaskStore, TerminalTransition};

/// Longest readable file stem; longer ids are stored under a digest.
const MAX_STEM_LEN: usize = 120;

/// File-based JSON storage backend.
pub struct JsonStore {
    root: PathBuf,
    table: Mutex<TaskTable>,
    journal: Mutex<()>,
    /// Exclusive lock on `.lock`, `None` when read-only
    lock: Option<std::fs::File>,
}

impl JsonStore {
    /// Open (or create) a store rooted at `root` for writing and index
    /// existing tasks.
    ///
    /// Fails with [`StoreError::Locked`] while another process has it open
    /// for writing.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("tasks")).await?;
        let lock = acquire_lock(&root)?;
        Self::load(root, Some(lock)).await
    }

    /// Open the current on-disk state without taking the writer lock.
    /// Every mutation fails with [`StoreError::ReadOnly`].
    pub async fn open_read_only(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !fs::try_exists(root.join("tasks")).await? {
            return Ok(Self {
                root,
                table: Mutex::new(TaskTable::default()),
                journal: Mutex::new(()),
                lock: None,
            });
        }
        Self::load(root, None).await
    }

    async fn load(root: PathBuf, lock: Option<std::fs::File>) -> Result<Self> {
        let tasks: Vec<Task> = list_dir(&root.join("tasks")).await?;
        debug!("Indexed {} tasks from {}", tasks.len(), root.display());

        Ok(Self {
            root,
            table: Mutex::new(TaskTable::from_tasks(tasks)),
            journal: Mutex::new(()),
            lock,
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether this handle may mutate the store.
    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    fn writable(&self) -> Result<()> {
        if self.lock.is_none() {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    fn task_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", file_stem(id.as_str())))
    }

    fn ledger_path(&self) -> PathBuf {
        self.root.join("ledger.json")
    }

    fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        self.writable()?;
        write_json(&self.task_path(&task.id), task).await
    }
}

fn acquire_lock(root: &Path) -> Result<std::fs::File> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(root.join(".lock"))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(StoreError::Locked(root.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TaskStore for JsonStore {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let mut table = self.table.lock().await;
        let task = table.plan_enqueue(task)?;
        self.persist(&task).await?;
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
        self.persist(&task).await?;
        table.put(task.clone());
        Ok(task)
    }

    async fn revert_assignment(&self, id: &TaskId, attempt_no: u32) -> Result<(Task, Option<Reservation>)> {
        let mut table = self.table.lock().await;
        let (task, reservation) = table.plan_revert(id, attempt_no)?;
        self.persist(&task).await?;
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
                self.persist(&task).await?;
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
            self.persist(&expiry.task).await?;
            table.put(expiry.task.clone());
        }
        Ok(expiry)
    }

    async fn abandon_exhausted(&self, id: &TaskId, max_attempts: u32, at: Time) -> Result<Option<Task>> {
        let mut table = self.table.lock().await;
        let task = table.plan_abandon_exhausted(id, max_attempts, at)?;
        if let Some(task) = &task {
            self.persist(task).await?;
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
impl Journal for JsonStore {
    async fn append_event(&self, event: &Event) -> Result<()> {
        self.writable()?;
        let _guard = self.journal.lock().await;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        let _guard = self.journal.lock().await;
        let text = match fs::read_to_string(self.events_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping unreadable journal line {}: {}", n + 1, e),
            }
        }

        let skip = limit.map_or(0, |n| events.len().saturating_sub(n));
        Ok(events.split_off(skip))
    }

    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        self.writable()?;
        write_json(&self.ledger_path(), snapshot).await
    }

    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>> {
        read_json(&self.ledger_path()).await
    }
}

/// Map an arbitrary id to a portable file name.
///
/// Short ids are percent-escaped and stay readable. Longer ones become
/// `%H` + SHA-256 hex, which no escaped id can produce; the real id lives
/// inside the file.
fn file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    if out.len() > MAX_STEM_LEN {
        return format!("%H{}", hex::encode(Sha256::digest(id.as_bytes())));
    }
    out
}

/// Write via a temporary file and rename, so readers never see a torn file.
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable {}: {}", entry.path().display(), e),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use constellation_core::{AgentId, EventKind, TaskState, TierConfig, TierEntry};

    #[tokio::test]
    async fn test_tasks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let id = TaskId::new("wrap/api-42");

        {
            let store = JsonStore::open(dir.path()).await.unwrap();
            store.enqueue(Task::new(id.clone(), "wrap", 4, now)).await.unwrap();
            store
                .mark_assigned(&id, Assignment { attempt_no: 1, at: now, reservation: None })
                .await
                .unwrap();
        }

        let store = JsonStore::open(dir.path()).await.unwrap();
        let task = store.get(&id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.attempt_count, 1);

        let err = store.enqueue(Task::new(id.clone(), "wrap", 1, now)).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_ledger_and_journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        assert!(store.load_ledger().await.unwrap().is_none());

        let snapshot = LedgerSnapshot {
            tiers: vec![TierEntry::new(TierConfig::new("conservative", 40.0))],
            open: vec![],
            taken_at: Some(Utc::now()),
        };
        store.save_ledger(&snapshot).await.unwrap();
        let loaded = store.load_ledger().await.unwrap().unwrap();
        assert_eq!(loaded.tiers, snapshot.tiers);

        for kind in [EventKind::TaskEnqueued, EventKind::TaskAssigned] {
            store
                .append_event(&Event::new(AgentId::dispatcher(), kind, "x", Utc::now()))
                .await
                .unwrap();
        }
        let events = store.list_events(Some(1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TaskAssigned);
    }

    #[test]
    fn test_file_stem_escapes() {
        assert_eq!(file_stem("abc-1_2"), "abc-1_2");
        assert_eq!(file_stem("a/b.c"), "a%2Fb%2Ec");
    }

    #[tokio::test]
    async fn test_long_ids_are_stored() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let long = TaskId::new("wrap/".repeat(60));
        let plain = TaskId::new("x".repeat(300));
        assert_eq!(file_stem(long.as_str()).len(), 66);
        assert_ne!(file_stem(long.as_str()), file_stem(plain.as_str()));

        {
            let store = JsonStore::open(dir.path()).await.unwrap();
            store.enqueue(Task::new(long.clone(), "wrap", 1, now)).await.unwrap();
            store.enqueue(Task::new(plain.clone(), "wrap", 1, now)).await.unwrap();
        }

        let store = JsonStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get(&long).await.unwrap().unwrap().id, long);
        assert_eq!(store.get(&plain).await.unwrap().unwrap().id, plain);
    }

    #[tokio::test]
    async fn test_second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let writer = JsonStore::open(dir.path()).await.unwrap();
        writer.enqueue(Task::new("a", "trade", 1, now)).await.unwrap();

        let err = JsonStore::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, StoreError::Locked(_)));

        let reader = JsonStore::open_read_only(dir.path()).await.unwrap();
        assert!(!reader.is_writable());
        assert!(reader.get(&TaskId::new("a")).await.unwrap().is_some());
        let err = reader.enqueue(Task::new("b", "trade", 1, now)).await.unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));

        drop(writer);
        assert!(JsonStore::open(dir.path()).await.is_ok());
    }
}
