//! Submission inbox for processes that do not own the data directory.
//!
//! Producers and workers drop one JSON file per submission into
//! `inbox/`; the process holding the writer lock applies them in arrival
//! order and removes them. Files that cannot be parsed or applied are
//! renamed to `*.rejected` and left for an operator.

use std::path::{Path, PathBuf};

use constellation_core::{TaskDeclaration, TaskResult};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::trait_::Result;

/// One submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxItem {
    /// A task declaration to enqueue
    Task(TaskDeclaration),
    /// A worker result to ingest
    Result(TaskResult),
}

/// A submission read from disk, not yet removed.
#[derive(Debug)]
pub struct InboxEntry {
    /// File holding the submission
    pub path: PathBuf,
    /// Parsed submission
    pub item: InboxItem,
}

/// Directory of pending submissions.
#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    /// Inbox under a data directory.
    pub fn for_data_dir(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join("inbox"),
        }
    }

    /// Inbox directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a submission. Names are ULIDs, so directory order is arrival
    /// order.
    pub async fn submit(&self, item: &InboxItem) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let name = format!("{}.json", Ulid::new());
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(name);
        fs::write(&tmp, serde_json::to_vec_pretty(item)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Submitted {}", path.display());
        Ok(path)
    }

    /// Pending submissions in arrival order. Unparseable files are rejected
    /// on the spot.
    pub async fn pending(&self) -> Result<Vec<InboxEntry>> {
        let mut rd = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            let text = fs::read_to_string(&path).await?;
            match serde_json::from_str::<InboxItem>(&text) {
                Ok(item) => entries.push(InboxEntry { path, item }),
                Err(e) => {
                    warn!("Rejecting unreadable submission {}: {}", path.display(), e);
                    self.reject(&path).await?;
                }
            }
        }
        Ok(entries)
    }

    /// Remove an applied submission.
    pub async fn complete(&self, entry: &InboxEntry) -> Result<()> {
        fs::remove_file(&entry.path).await?;
        Ok(())
    }

    /// Set a submission aside so it is not retried.
    pub async fn reject(&self, path: &Path) -> Result<()> {
        fs::rename(path, path.with_extension("rejected")).await?;
        Ok(())
    }
}
