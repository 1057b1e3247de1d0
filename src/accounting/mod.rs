//! Run accounting: counters, transfer records, rates, and the final summary.
//!
//! One [`Accountant`] exists per engine context. Transfer records are
//! append-only; workers address them by [`TransferId`] index so nothing
//! holds a reference into the accountant across await points.

pub mod bandwidth;

use crate::error::{Error, ErrorKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// EWMA time constant for per-transfer bandwidth.
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Running,
    Checking,
    Done,
    Failed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed | TransferState::Aborted)
    }
}

/// Index of a transfer record inside the accountant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferId(usize);

/// Live record of one in-flight copy.
#[derive(Debug)]
pub struct TransferRecord {
    pub path: String,
    pub size: i64,
    pub state: TransferState,
    pub bytes: u64,
    pub started: Instant,
    pub attempts: u32,
    pub error: Option<String>,
    ewma_bps: f64,
    last_update: Instant,
}

impl TransferRecord {
    /// Smoothed bytes per second over the rate window.
    pub fn rate(&self) -> f64 {
        self.ewma_bps
    }

    /// Estimated time to completion, when the size is known.
    pub fn eta(&self) -> Option<Duration> {
        if self.size < 0 || self.ewma_bps <= 1.0 {
            return None;
        }
        let remaining = (self.size as u64).saturating_sub(self.bytes);
        Some(Duration::from_secs_f64(remaining as f64 / self.ewma_bps))
    }
}

/// Progress snapshot of one running transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub path: String,
    pub bytes: u64,
    pub size: i64,
    pub bps: f64,
    pub eta: Option<Duration>,
}

/// Final statistics of a run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub transferred: u64,
    pub checks: u64,
    pub deletes: u64,
    pub renames: u64,
    pub errors: u64,
    pub bytes: u64,
    pub duration: Duration,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub cancelled: bool,
    pub fatal: bool,
    pub limit_reached: bool,
    /// Deletes were skipped because a transfer failed in delete-after mode.
    pub deletes_skipped: bool,
}

impl Summary {
    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return 9;
        }
        if self.fatal {
            return 7;
        }
        if self.limit_reached {
            return 8;
        }
        if self.errors == 0 {
            return 0;
        }
        let only_retryable = self
            .errors_by_kind
            .keys()
            .all(|kind| kind.is_retryable());
        if only_retryable {
            5
        } else {
            6
        }
    }
}

/// Process-wide counters and transfer records for one run.
pub struct Accountant {
    started: Instant,
    bytes: AtomicU64,
    checks: AtomicU64,
    deletes: AtomicU64,
    renames: AtomicU64,
    transfers_started: AtomicU64,
    transfers_finished: AtomicU64,
    transfers_failed: AtomicU64,
    cancelled: AtomicBool,
    fatal: AtomicBool,
    limit_reached: AtomicBool,
    deletes_skipped: AtomicBool,
    errors: Mutex<HashMap<ErrorKind, u64>>,
    records: Mutex<Vec<TransferRecord>>,
}

impl Default for Accountant {
    fn default() -> Self {
        Self::new()
    }
}

impl Accountant {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            renames: AtomicU64::new(0),
            transfers_started: AtomicU64::new(0),
            transfers_finished: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            limit_reached: AtomicBool::new(false),
            deletes_skipped: AtomicBool::new(false),
            errors: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Open a record for a transfer that is about to run.
    pub fn start_transfer(&self, path: &str, size: i64) -> TransferId {
        self.transfers_started.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        records.push(TransferRecord {
            path: path.to_string(),
            size,
            state: TransferState::Running,
            bytes: 0,
            started: Instant::now(),
            attempts: 0,
            error: None,
            ewma_bps: 0.0,
            last_update: Instant::now(),
        });
        TransferId(records.len() - 1)
    }

    /// Count `n` transferred bytes against the global total and the record.
    ///
    /// The global counter is monotonic: retried bytes count again, it never
    /// decrements.
    pub fn record_bytes(&self, id: TransferId, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        let rec = &mut records[id.0];
        rec.bytes += n;

        let now = Instant::now();
        let dt = now.duration_since(rec.last_update).as_secs_f64();
        if dt > 0.0 {
            let instant_bps = n as f64 / dt;
            let weight = (-dt / RATE_WINDOW.as_secs_f64()).exp();
            rec.ewma_bps = weight * rec.ewma_bps + (1.0 - weight) * instant_bps;
        }
        rec.last_update = now;
    }

    pub fn set_state(&self, id: TransferId, state: TransferState) {
        let mut records = self.records.lock().unwrap();
        records[id.0].state = state;
    }

    pub fn add_attempt(&self, id: TransferId) {
        let mut records = self.records.lock().unwrap();
        records[id.0].attempts += 1;
    }

    pub fn attempts(&self, id: TransferId) -> u32 {
        self.records.lock().unwrap()[id.0].attempts
    }

    pub fn transfer_done(&self, id: TransferId) {
        self.transfers_finished.fetch_add(1, Ordering::Relaxed);
        self.set_state(id, TransferState::Done);
    }

    pub fn transfer_failed(&self, id: TransferId, error: &Error) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        let rec = &mut records[id.0];
        rec.state = TransferState::Failed;
        rec.error = Some(error.to_string());
    }

    pub fn transfer_aborted(&self, id: TransferId) {
        let mut records = self.records.lock().unwrap();
        let rec = &mut records[id.0];
        rec.state = TransferState::Aborted;
    }

    pub fn check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rename(&self) {
        self.renames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        *self.errors.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    pub fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Relaxed);
    }

    pub fn set_limit_reached(&self) {
        self.limit_reached.store(true, Ordering::Relaxed);
    }

    pub fn set_deletes_skipped(&self) {
        self.deletes_skipped.store(true, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn transfers_started(&self) -> u64 {
        self.transfers_started.load(Ordering::Relaxed)
    }

    pub fn transfers_finished(&self) -> u64 {
        self.transfers_finished.load(Ordering::Relaxed)
    }

    pub fn transfers_failed(&self) -> u64 {
        self.transfers_failed.load(Ordering::Relaxed)
    }

    /// Progress of transfers that are still running, for periodic reporting.
    pub fn running(&self) -> Vec<TransferProgress> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .filter(|rec| !rec.state.is_terminal())
            .map(|rec| TransferProgress {
                path: rec.path.clone(),
                bytes: rec.bytes,
                size: rec.size,
                bps: rec.rate(),
                eta: rec.eta(),
            })
            .collect()
    }

    /// Overall bytes per second since the run started.
    pub fn global_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> Summary {
        let errors_by_kind = self.errors.lock().unwrap().clone();
        Summary {
            transferred: self.transfers_finished(),
            checks: self.checks(),
            deletes: self.deletes(),
            renames: self.renames.load(Ordering::Relaxed),
            errors: errors_by_kind.values().sum(),
            bytes: self.bytes(),
            duration: self.started.elapsed(),
            errors_by_kind,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            limit_reached: self.limit_reached.load(Ordering::Relaxed),
            deletes_skipped: self.deletes_skipped.load(Ordering::Relaxed),
        }
    }
}
