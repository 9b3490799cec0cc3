//! Storage abstraction and implementations for Constellation.
//!
//! This crate provides the task store and journal contracts with an
//! in-memory backend, a JSON-file reference implementation and the
//! submission inbox used by processes that do not own the data directory.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod inbox;
pub mod memory;
mod table;

pub use trait_::{
    TaskStore, Journal, StoreError, Result, TerminalTransition, Expiry, ExpiryAction,
    EligibleTasks, EligibleCursor,
};
pub use json_storage::JsonStore;
pub use inbox::{Inbox, InboxEntry, InboxItem};
pub use memory::MemoryStore;
