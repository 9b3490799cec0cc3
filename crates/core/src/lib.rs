//! Constellation core data models.
//!
//! This crate defines the data structures shared by the task store, the
//! budget ledger and the dispatch loop.

#![warn(missing_docs)]

// Core identities
mod id;

// Work items
mod task;
mod result;
mod dispatch;
mod event;

// Capacity
mod tier;

// Configuration
mod config;

// Re-exports
pub use id::*;

pub use task::{
    Task, TaskKind, TaskState, TerminalState, TaskDeclaration, CapitalRequest,
    Assignment, TaskFilter, TaskStats,
};
pub use result::{TaskResult, Outcome};
pub use dispatch::DispatchNotice;
pub use event::{Event, EventKind};
pub use tier::{
    TierConfig, TierEntry, TierStatus, BreakerStatus, Reservation, LedgerSnapshot,
};
pub use config::{OrchestratorConfig, WorkerConfig, Transport, ConfigError};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
