//! Engine context: everything a component needs, passed explicitly.
//!
//! There is no global state; tests build one context per case.

use crate::accounting::bandwidth::BandwidthLimiter;
use crate::accounting::Accountant;
use crate::config::SyncOptions;
use crate::error::{Error, Result};
use crate::reporter::{LogReporter, Reporter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handles for one run: options, accounting, bandwidth budget,
/// cancellation, and the event sink.
#[derive(Clone)]
pub struct EngineContext {
    pub opts: Arc<SyncOptions>,
    pub accountant: Arc<Accountant>,
    pub limiter: BandwidthLimiter,
    pub cancel: CancellationToken,
    pub reporter: Arc<dyn Reporter>,
}

impl EngineContext {
    pub fn new(opts: SyncOptions) -> Self {
        Self::with_reporter(opts, Arc::new(LogReporter))
    }

    pub fn with_reporter(opts: SyncOptions, reporter: Arc<dyn Reporter>) -> Self {
        let limiter = BandwidthLimiter::new(opts.bandwidth);
        Self {
            opts: Arc::new(opts),
            accountant: Arc::new(Accountant::new()),
            limiter,
            cancel: CancellationToken::new(),
            reporter,
        }
    }

    /// Err(`Cancelled`) once the token has fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }

    /// Whether the byte budget (if any) has been exhausted.
    pub fn transfer_limit_reached(&self) -> bool {
        match self.opts.max_transfer {
            Some(limit) => self.accountant.bytes() >= limit,
            None => false,
        }
    }
}
