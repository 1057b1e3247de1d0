//! Low-level retry with exponential backoff.
//!
//! Wraps every remote call. Only `Transient` and `QuotaExceeded` failures
//! are re-attempted; everything else bubbles to the caller immediately.
//! Backoff doubles from `retry_base` up to `retry_cap` with ±25% jitter,
//! and both the attempt and the sleep race the cancellation token.

use crate::context::EngineContext;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Un-jittered delay before attempt `n + 1`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(cap)
}

fn jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}

/// Run `attempt` under the context's low-level retry policy.
///
/// Each invocation of `attempt` is raced against the cancellation token and
/// the per-call deadline (`op_timeout`), so a stuck driver cannot wedge the
/// run.
pub async fn with_retries<T, F, Fut>(ctx: &EngineContext, op: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = ctx.opts.low_level_retries.max(1);
    let base = ctx.opts.retry_base;
    let cap = ctx.opts.retry_cap;

    for n in 0..attempts {
        ctx.check_cancelled()?;

        let fut = attempt();
        let result = match ctx.opts.op_timeout {
            Some(deadline) => tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(Error::cancelled()),
                out = tokio::time::timeout(deadline, fut) => match out {
                    Ok(r) => r,
                    Err(_) => Err(Error::timeout(deadline)),
                },
            },
            None => tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(Error::cancelled()),
                r = fut => r,
            },
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && n + 1 < attempts => {
                let delay = jitter(backoff_delay(base, cap, n));
                tracing::debug!(
                    op,
                    attempt = n + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(Error::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_ctx(attempts: u32) -> EngineContext {
        let mut opts = SyncOptions::default();
        opts.low_level_retries = attempts;
        opts.retry_base = Duration::from_millis(1);
        opts.retry_cap = Duration::from_millis(4);
        EngineContext::new(opts)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 10), cap);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let ctx = fast_ctx(5);
        let calls = AtomicU32::new(0);

        let result = with_retries(&ctx, "stat", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("flaky"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_bubbles_immediately() {
        let ctx = fast_ctx(5);
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retries(&ctx, "stat", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::not_found("gone"))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let ctx = fast_ctx(3);
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retries(&ctx, "put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::quota("slow down"))
        })
        .await;

        assert_eq!(
            result.unwrap_err().kind(),
            crate::error::ErrorKind::QuotaExceeded
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let ctx = fast_ctx(1000);
        ctx.cancel.cancel();

        let result: Result<()> = with_retries(&ctx, "list", || async {
            Err(Error::transient("never tried"))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Cancelled);
    }
}
