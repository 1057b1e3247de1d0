//! Engine configuration.
//!
//! All knobs live in [`SyncOptions`]; an instance is carried by the
//! [`crate::context::EngineContext`] and read-only thereafter. Defaults are
//! sized for wide-area object storage.

use crate::accounting::bandwidth::BandwidthLimit;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// When destination-side deletes run relative to copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeleteMode {
    /// All deletes before any copy starts.
    Before,
    /// Deletes interleaved with copies as pairs stream.
    During,
    /// Deletes only after every copy succeeded (default). A failed copy
    /// leaves the destination a superset of the source.
    #[default]
    After,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// When deletes run in sync mode.
    pub delete_mode: DeleteMode,
    /// Classify and report, but perform no remote mutation.
    pub dry_run: bool,
    /// Treat objects with equal size as equal, ignoring hashes and mtimes.
    pub size_only: bool,
    /// Treat every pair as unequal, forcing re-copy.
    pub ignore_times: bool,

    /// Concurrent equality checks and deletes.
    pub checkers: usize,
    /// Concurrent transfers.
    pub transfers: usize,
    /// Concurrent renames; defaults to `transfers` when unset.
    pub renamers: Option<usize>,
    /// Cap on outstanding remote operations across all pools.
    pub max_outstanding: usize,
    /// Capacity of the tree-walk pair queue (back-pressure bound).
    pub march_queue: usize,

    /// Whole-transfer attempts.
    pub retries: u32,
    /// Per-remote-call attempts inside one transfer.
    pub low_level_retries: u32,
    /// Extra whole-transfer attempts consumed only by checksum mismatches.
    pub max_checksum_retries: u32,
    /// First backoff delay.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
    /// Per-remote-call deadline; `None` disables.
    pub op_timeout: Option<Duration>,

    /// Modification times within this window compare equal.
    pub mtime_tolerance: Duration,

    /// Sizes at or above this use the multi-part path when the destination
    /// supports it.
    pub multipart_threshold: u64,
    /// Bytes per uploaded part.
    pub multipart_chunk: usize,
    /// Concurrent part uploads per transfer.
    pub multipart_concurrency: usize,

    /// Permit server-side copy/move when source and destination are the
    /// same remote.
    pub server_side: bool,
    /// Match unpaired objects by size+hash and rename instead of re-copying.
    pub track_renames: bool,
    /// Abort the whole run on the first permanent failure.
    pub fail_fast: bool,

    /// Global bandwidth budget.
    pub bandwidth: BandwidthLimit,
    /// Stop scheduling new transfers once this many bytes have moved.
    pub max_transfer: Option<u64>,

    /// Resume journal sidecar; `None` disables journalling.
    pub journal: Option<PathBuf>,

    /// How long cancellation may take to drain in-flight workers.
    pub cancellation_grace: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete_mode: DeleteMode::After,
            dry_run: false,
            size_only: false,
            ignore_times: false,
            checkers: 8,
            transfers: 4,
            renamers: None,
            max_outstanding: 32,
            march_queue: 128,
            retries: 3,
            low_level_retries: 10,
            max_checksum_retries: 1,
            retry_base: Duration::from_millis(250),
            retry_cap: Duration::from_secs(10),
            op_timeout: None,
            mtime_tolerance: Duration::from_secs(1),
            multipart_threshold: 32 * 1024 * 1024,
            multipart_chunk: 8 * 1024 * 1024,
            multipart_concurrency: 4,
            server_side: true,
            track_renames: false,
            fail_fast: false,
            bandwidth: BandwidthLimit::unlimited(),
            max_transfer: None,
            journal: None,
            cancellation_grace: Duration::from_secs(5),
        }
    }
}

impl SyncOptions {
    pub fn renamers(&self) -> usize {
        self.renamers.unwrap_or(self.transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SyncOptions::default();
        assert_eq!(opts.delete_mode, DeleteMode::After);
        assert_eq!(opts.checkers, 8);
        assert_eq!(opts.transfers, 4);
        assert_eq!(opts.renamers(), 4);
        assert_eq!(opts.retries, 3);
        assert_eq!(opts.low_level_retries, 10);
        assert_eq!(opts.max_checksum_retries, 1);
        assert_eq!(opts.mtime_tolerance, Duration::from_secs(1));
        assert!(!opts.dry_run);
        assert!(opts.journal.is_none());
    }

    #[test]
    fn test_roundtrip_through_json() {
        let mut opts = SyncOptions::default();
        opts.transfers = 16;
        opts.track_renames = true;
        let encoded = serde_json::to_string(&opts).unwrap();
        let decoded: SyncOptions = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.transfers, 16);
        assert!(decoded.track_renames);
    }
}
