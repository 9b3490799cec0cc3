//! Worker execution contract and notification transports.
//!
//! The orchestrator never runs work itself. A worker declares the task kinds
//! it handles; when a task is assigned, its notifier receives a
//! [`DispatchNotice`] and the worker later reports exactly one
//! [`TaskResult`](constellation_core::TaskResult) through the collector, or
//! stays silent and the timeout sweep reclaims the task.
//!
//! Workers may see the same task more than once (after a timeout, with a
//! higher attempt number) and are expected to handle it idempotently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use constellation_core::{DispatchNotice, TaskKind, Transport, WorkerConfig};
use reqwest::{Client, ClientBuilder};
use tracing::debug;

/// Errors delivering a dispatch notice.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("worker endpoint returned {status}: {body}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Delivery did not finish in time
    #[error("notification timed out")]
    Timeout,
}

/// Delivers dispatch notices to a worker. Fire-and-forget: returning `Ok`
/// means the notice was handed over, not that the work is done.
#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    /// Deliver one notice.
    async fn notify(&self, notice: &DispatchNotice) -> Result<(), NotifyError>;
}

/// POSTs notices as JSON to a worker endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier for `url`. Fails if the HTTP client cannot be
    /// built (e.g. no TLS backend).
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = ClientBuilder::new()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WorkerNotifier for WebhookNotifier {
    async fn notify(&self, notice: &DispatchNotice) -> Result<(), NotifyError> {
        debug!("POST {} for task {}", self.url, notice.task_id);
        let response = self.client.post(&self.url).json(notice).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Writes each notice as a JSON file into an outbox directory, for workers
/// that poll a shared directory or a synced repository.
#[derive(Debug, Clone)]
pub struct SpoolNotifier {
    dir: PathBuf,
}

impl SpoolNotifier {
    /// Spool into `dir`, created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Outbox directory.
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[async_trait]
impl WorkerNotifier for SpoolNotifier {
    async fn notify(&self, notice: &DispatchNotice) -> Result<(), NotifyError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stem: String = notice
            .task_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let name = format!("{}-attempt{}.json", stem, notice.attempt);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(notice)?).await?;
        tokio::fs::rename(&tmp, self.dir.join(&name)).await?;
        debug!("Spooled {} into {}", name, self.dir.display());
        Ok(())
    }
}

/// Routes task kinds to the worker that declared them.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    routes: HashMap<TaskKind, (String, Arc<dyn WorkerNotifier>)>,
}

impl WorkerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration.
    pub fn from_config(workers: &[WorkerConfig]) -> Result<Self, NotifyError> {
        let mut registry = Self::new();
        for worker in workers {
            let notifier: Arc<dyn WorkerNotifier> = match &worker.transport {
                Transport::Webhook { url } => Arc::new(WebhookNotifier::new(url.clone())?),
                Transport::Spool { dir } => Arc::new(SpoolNotifier::new(dir.clone())),
            };
            registry.register(worker.name.clone(), worker.kinds.iter().cloned(), notifier);
        }
        Ok(registry)
    }

    /// Register a worker for the given kinds. Later registrations win.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kinds: impl IntoIterator<Item = TaskKind>,
        notifier: Arc<dyn WorkerNotifier>,
    ) {
        let name = name.into();
        for kind in kinds {
            self.routes.insert(kind, (name.clone(), notifier.clone()));
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_worker(
        mut self,
        name: impl Into<String>,
        kinds: impl IntoIterator<Item = TaskKind>,
        notifier: Arc<dyn WorkerNotifier>,
    ) -> Self {
        self.register(name, kinds, notifier);
        self
    }

    /// Worker name and notifier for a kind.
    pub fn route(&self, kind: &TaskKind) -> Option<(&str, Arc<dyn WorkerNotifier>)> {
        self.routes.get(kind).map(|(name, n)| (name.as_str(), n.clone()))
    }

    /// Every `(kind, worker name)` pair.
    pub fn routes(&self) -> impl Iterator<Item = (&TaskKind, &str)> {
        self.routes.iter().map(|(kind, (name, _))| (kind, name.as_str()))
    }

    /// Kinds with a registered worker, sorted.
    pub fn kinds(&self) -> Vec<&TaskKind> {
        let mut kinds: Vec<_> = self.routes.keys().collect();
        kinds.sort();
        kinds
    }
}
