// Shared fixtures for engine integration tests

use chrono::{DateTime, Utc};
use driftsync::backend::memory::MemoryBackend;
use driftsync::backend::Backend;
use driftsync::reporter::MemoryReporter;
use driftsync::{EngineContext, Result, Summary, SyncOptions};
use std::sync::Arc;
use std::time::Duration;

pub fn mod_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

/// Options with millisecond backoff so fault-injection tests stay fast.
pub fn fast_opts() -> SyncOptions {
    let mut opts = SyncOptions::default();
    opts.retry_base = Duration::from_millis(1);
    opts.retry_cap = Duration::from_millis(8);
    opts
}

/// A source/destination pair of memory backends plus per-run contexts.
pub struct Harness {
    pub src: Arc<MemoryBackend>,
    pub dst: Arc<MemoryBackend>,
    pub opts: SyncOptions,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_opts(fast_opts())
    }

    pub fn with_opts(opts: SyncOptions) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        Self {
            src: Arc::new(MemoryBackend::new("src")),
            dst: Arc::new(MemoryBackend::new("dst")),
            opts,
        }
    }

    fn context(&self) -> (EngineContext, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        let ctx = EngineContext::with_reporter(self.opts.clone(), reporter.clone());
        (ctx, reporter)
    }

    /// Run a one-way sync (deletes extras); panics on run-level failure.
    pub async fn sync(&self) -> (Summary, Arc<MemoryReporter>) {
        self.try_sync().await.expect("sync failed")
    }

    pub async fn try_sync(&self) -> Result<(Summary, Arc<MemoryReporter>)> {
        let (ctx, reporter) = self.context();
        let src: Arc<dyn Backend> = self.src.clone();
        let dst: Arc<dyn Backend> = self.dst.clone();
        let summary = driftsync::sync(&ctx, src, dst, "").await?;
        Ok((summary, reporter))
    }

    /// Run a one-way copy (leaves extras in place).
    pub async fn copy(&self) -> (Summary, Arc<MemoryReporter>) {
        let (ctx, reporter) = self.context();
        let src: Arc<dyn Backend> = self.src.clone();
        let dst: Arc<dyn Backend> = self.dst.clone();
        let summary = driftsync::copy(&ctx, src, dst, "").await.expect("copy failed");
        (summary, reporter)
    }

    /// Run a sync on an externally built context (e.g. to cancel it).
    pub async fn sync_with_ctx(&self, ctx: &EngineContext) -> Result<Summary> {
        let src: Arc<dyn Backend> = self.src.clone();
        let dst: Arc<dyn Backend> = self.dst.clone();
        driftsync::sync(ctx, src, dst, "").await
    }
}
