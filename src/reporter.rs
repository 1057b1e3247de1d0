//! Structured run events.
//!
//! The engine reports through a [`Reporter`] rather than printing: the
//! default [`LogReporter`] forwards to `tracing`, and [`MemoryReporter`]
//! collects events for tests and dry-run inspection.

use crate::accounting::Summary;
use crate::error::ErrorKind;
use crate::planner::Action;
use std::sync::Mutex;
use std::time::Duration;

/// Receiver of engine events. All methods default to no-ops so
/// implementations override only what they need.
#[allow(unused_variables)]
pub trait Reporter: Send + Sync {
    /// A planner decision, emitted before any execution (and in dry-run,
    /// instead of it).
    fn planned(&self, action: &Action) {}

    fn transfer_started(&self, path: &str, size: i64) {}

    /// Periodic progress, roughly once per second per running transfer.
    fn transfer_progress(&self, path: &str, bytes: u64, bps: f64, eta: Option<Duration>) {}

    fn transfer_finished(&self, path: &str, bytes: u64, duration: Duration, checksum_ok: bool) {}

    fn transfer_failed(&self, path: &str, kind: ErrorKind, message: &str, attempts: u32) {}

    fn skipped(&self, path: &str, reason: &str) {}

    fn deleted(&self, path: &str) {}

    fn summary(&self, summary: &Summary) {}
}

/// Reporter that forwards everything to `tracing`.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn planned(&self, action: &Action) {
        tracing::debug!(action = %action.describe(), path = action.path(), "planned");
    }

    fn transfer_started(&self, path: &str, size: i64) {
        tracing::info!(path, size, "transfer started");
    }

    fn transfer_progress(&self, path: &str, bytes: u64, bps: f64, eta: Option<Duration>) {
        tracing::debug!(path, bytes, bps = bps as u64, eta_secs = eta.map(|e| e.as_secs()), "progress");
    }

    fn transfer_finished(&self, path: &str, bytes: u64, duration: Duration, checksum_ok: bool) {
        tracing::info!(
            path,
            bytes,
            elapsed_ms = duration.as_millis() as u64,
            checksum_ok,
            "transfer finished"
        );
    }

    fn transfer_failed(&self, path: &str, kind: ErrorKind, message: &str, attempts: u32) {
        tracing::error!(path, %kind, message, attempts, "transfer failed");
    }

    fn skipped(&self, path: &str, reason: &str) {
        tracing::debug!(path, reason, "skipped");
    }

    fn deleted(&self, path: &str) {
        tracing::info!(path, "deleted");
    }

    fn summary(&self, summary: &Summary) {
        tracing::info!(
            transferred = summary.transferred,
            checks = summary.checks,
            deletes = summary.deletes,
            errors = summary.errors,
            bytes = summary.bytes,
            elapsed_ms = summary.duration.as_millis() as u64,
            "run complete"
        );
    }
}

/// One collected event.
#[derive(Debug, Clone)]
pub enum Event {
    Planned(Action),
    Started { path: String, size: i64 },
    Progress { path: String, bytes: u64 },
    Finished { path: String, bytes: u64, checksum_ok: bool },
    Failed { path: String, kind: ErrorKind, attempts: u32 },
    Skipped { path: String, reason: String },
    Deleted { path: String },
    Summary(Summary),
}

/// Reporter that stores every event in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<Event>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// The planner's decisions, in emission order.
    pub fn planned_actions(&self) -> Vec<Action> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Planned(action) => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_paths(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Deleted { path } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Reporter for MemoryReporter {
    fn planned(&self, action: &Action) {
        self.push(Event::Planned(action.clone()));
    }

    fn transfer_started(&self, path: &str, size: i64) {
        self.push(Event::Started { path: path.to_string(), size });
    }

    fn transfer_progress(&self, path: &str, bytes: u64, _bps: f64, _eta: Option<Duration>) {
        self.push(Event::Progress { path: path.to_string(), bytes });
    }

    fn transfer_finished(&self, path: &str, bytes: u64, _duration: Duration, checksum_ok: bool) {
        self.push(Event::Finished { path: path.to_string(), bytes, checksum_ok });
    }

    fn transfer_failed(&self, path: &str, kind: ErrorKind, _message: &str, attempts: u32) {
        self.push(Event::Failed { path: path.to_string(), kind, attempts });
    }

    fn skipped(&self, path: &str, reason: &str) {
        self.push(Event::Skipped {
            path: path.to_string(),
            reason: reason.to_string(),
        });
    }

    fn deleted(&self, path: &str) {
        self.push(Event::Deleted { path: path.to_string() });
    }

    fn summary(&self, summary: &Summary) {
        self.push(Event::Summary(summary.clone()));
    }
}
