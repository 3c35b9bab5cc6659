//! Scheduler layer for the runner
//!
//! Discovers subscriptions and keeps one worker per subscription running
//! against the configured queue backend.

pub mod watcher;
pub mod worker;

pub use watcher::QueueWatcher;
