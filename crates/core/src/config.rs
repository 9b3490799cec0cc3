//! Orchestrator configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::TaskKind;
use crate::tier::TierConfig;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML syntax or shape error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Semantically invalid configuration
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding durable state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Capacity tiers, at least one
    pub tiers: Vec<TierConfig>,

    /// Seconds an assignment may stay open before the sweep reclaims it
    #[serde(default = "default_max_assignment_age")]
    pub max_assignment_age_secs: u64,

    /// Maximum assignment attempts per task
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds between dispatch cycles
    #[serde(default = "default_cycle_interval")]
    pub dispatch_cycle_interval_secs: u64,

    /// Seconds allowed for a single worker notification
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,

    /// Seconds a worker may leave an assignment unanswered before it is
    /// reported silent (default: twice `max_assignment_age_secs`)
    #[serde(default)]
    pub worker_silence_secs: Option<u64>,

    /// Cap on assignments per cycle
    #[serde(default)]
    pub max_dispatch_per_cycle: Option<usize>,

    /// Worker registrations
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".constellation")
}

fn default_max_assignment_age() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_cycle_interval() -> u64 {
    300
}

fn default_notify_timeout() -> u64 {
    10
}

/// A worker and the kinds it handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name
    pub name: String,

    /// Kinds routed to this worker
    pub kinds: Vec<TaskKind>,

    /// How notices reach the worker
    pub transport: Transport,
}

/// Notification transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// POST the notice as JSON
    Webhook {
        /// Endpoint URL
        url: String,
    },
    /// Write one JSON file per notice
    Spool {
        /// Outbox directory
        dir: PathBuf,
    },
}

impl OrchestratorConfig {
    /// Configuration with the given tiers and defaults elsewhere.
    pub fn with_tiers(tiers: Vec<TierConfig>) -> Self {
        Self {
            data_dir: default_data_dir(),
            tiers,
            max_assignment_age_secs: default_max_assignment_age(),
            max_attempts: default_max_attempts(),
            dispatch_cycle_interval_secs: default_cycle_interval(),
            notify_timeout_secs: default_notify_timeout(),
            worker_silence_secs: None,
            max_dispatch_per_cycle: None,
            workers: Vec::new(),
        }
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Invalid("at least one tier is required".into()));
        }

        let mut names = HashSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate tier '{}'", tier.name)));
            }
            if !(tier.initial_capacity >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "tier '{}' initial_capacity must be >= 0",
                    tier.name
                )));
            }
            for (label, value) in [
                ("max_drawdown_from_initial_pct", tier.max_drawdown_from_initial_pct),
                ("max_drawdown_from_peak_pct", tier.max_drawdown_from_peak_pct),
            ] {
                if let Some(v) = value {
                    if !(v > 0.0 && v <= 1.0) {
                        return Err(ConfigError::Invalid(format!(
                            "tier '{}' {label} must be a fraction in (0, 1], got {v}",
                            tier.name
                        )));
                    }
                }
            }
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be >= 1".into()));
        }
        if self.max_assignment_age_secs == 0 {
            return Err(ConfigError::Invalid("max_assignment_age_secs must be > 0".into()));
        }
        if self.dispatch_cycle_interval_secs == 0 {
            return Err(ConfigError::Invalid("dispatch_cycle_interval_secs must be > 0".into()));
        }

        let mut claimed = HashSet::new();
        for worker in &self.workers {
            for kind in &worker.kinds {
                if !claimed.insert(kind.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "kind '{kind}' is claimed by more than one worker"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Assignment timeout.
    pub fn max_assignment_age(&self) -> Duration {
        Duration::from_secs(self.max_assignment_age_secs)
    }

    /// Interval between dispatch cycles.
    pub fn dispatch_cycle_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_cycle_interval_secs)
    }

    /// Per-notification timeout.
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    /// How long a worker may stay silent before it is reported.
    pub fn worker_silence(&self) -> Duration {
        let secs = self
            .worker_silence_secs
            .unwrap_or_else(|| self.max_assignment_age_secs.saturating_mul(2));
        Duration::from_secs(secs)
    }
}
