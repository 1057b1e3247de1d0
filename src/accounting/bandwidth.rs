//! Transfer-rate pacing.
//!
//! Every chunk a transfer pump moves is charged against a shared token
//! bucket before it is forwarded, so concurrent transfers split the
//! configured budget by draining the same bucket. Tokens are 4 KiB cells;
//! chunks larger than the bucket's burst are charged in burst-sized
//! slices. A pump waiting for capacity is unblocked immediately by
//! cancellation.

use crate::error::{Error, Result};
use governor::{Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pacing granularity: chunks are charged in whole cells, rounded up.
const CELL: usize = 4096;

/// Ceiling on engine throughput in bytes per second. Zero disables pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BandwidthLimit {
    rate: u64,
}

impl BandwidthLimit {
    pub fn per_second(rate: u64) -> Self {
        Self { rate }
    }

    pub fn unlimited() -> Self {
        Self { rate: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// The configured rate, or `None` when pacing is off.
    pub fn bytes_per_second(&self) -> Option<u64> {
        (self.rate > 0).then_some(self.rate)
    }
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rate == 0 {
            return f.write_str("off");
        }
        if self.rate >= 1 << 30 {
            write!(f, "{:.1} GiB/s", self.rate as f64 / (1u64 << 30) as f64)
        } else if self.rate >= 1 << 20 {
            write!(f, "{:.1} MiB/s", self.rate as f64 / (1u64 << 20) as f64)
        } else if self.rate >= 1 << 10 {
            write!(f, "{:.1} KiB/s", self.rate as f64 / (1u64 << 10) as f64)
        } else {
            write!(f, "{} B/s", self.rate)
        }
    }
}

type Bucket = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Shared pacing bucket. Cloning hands out another handle to the same
/// bucket, which is how concurrent pumps end up fair-sharing it.
#[derive(Clone)]
pub struct BandwidthLimiter {
    bucket: Option<Arc<Bucket>>,
    burst_cells: u32,
}

impl BandwidthLimiter {
    pub fn new(limit: BandwidthLimit) -> Self {
        let Some(rate) = limit.bytes_per_second() else {
            return Self::unlimited();
        };
        let cells = (rate / CELL as u64).clamp(1, u32::MAX as u64) as u32;
        match NonZeroU32::new(cells) {
            Some(cells_per_second) => Self {
                bucket: Some(Arc::new(RateLimiter::direct(Quota::per_second(
                    cells_per_second,
                )))),
                burst_cells: cells,
            },
            None => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            bucket: None,
            burst_cells: 0,
        }
    }

    /// Charge `bytes` against the budget, waiting for capacity. Chunks
    /// wider than the burst are charged slice by slice. Returns
    /// `Cancelled` as soon as the token fires, even mid-wait.
    pub async fn throttle(&self, bytes: usize, cancel: &CancellationToken) -> Result<()> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };
        let mut cells = bytes.div_ceil(CELL).max(1) as u64;
        while cells > 0 {
            let want = cells.min(self.burst_cells as u64) as u32;
            let Some(want) = NonZeroU32::new(want) else {
                break;
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                granted = bucket.until_n_ready(want) => {
                    granted.map_err(|_| {
                        Error::no_retry("bandwidth burst smaller than one pacing slice")
                    })?;
                }
            }
            cells -= want.get() as u64;
        }
        Ok(())
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_limit_display() {
        assert_eq!(BandwidthLimit::unlimited().to_string(), "off");
        assert_eq!(BandwidthLimit::per_second(512).to_string(), "512 B/s");
        assert_eq!(BandwidthLimit::per_second(1536).to_string(), "1.5 KiB/s");
        assert_eq!(
            BandwidthLimit::per_second(8 * 1024 * 1024).to_string(),
            "8.0 MiB/s"
        );
        assert_eq!(
            BandwidthLimit::per_second(3 * (1u64 << 30)).to_string(),
            "3.0 GiB/s"
        );
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::unlimited();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        for _ in 0..8 {
            limiter.throttle(64 * 1024 * 1024, &cancel).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pump_chunks_are_paced() {
        // 8 KiB/s is two cells per second; the bucket starts with a
        // two-cell burst. Three pump chunks of one cell each: the third
        // has to wait for a refill.
        let limiter = BandwidthLimiter::new(BandwidthLimit::per_second(8 * 1024));
        let cancel = CancellationToken::new();
        let started = Instant::now();
        for _ in 0..3 {
            limiter.throttle(4096, &cancel).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_chunk_wider_than_burst_is_sliced() {
        // A 12 KiB chunk against an 8 KiB/s budget exceeds the burst; it
        // must be split across refills rather than rejected.
        let limiter = BandwidthLimiter::new(BandwidthLimit::per_second(8 * 1024));
        let cancel = CancellationToken::new();
        let started = Instant::now();
        limiter.throttle(12 * 1024, &cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_a_waiting_pump() {
        // One cell per second; drain the burst, then park a large charge.
        let limiter = BandwidthLimiter::new(BandwidthLimit::per_second(4096));
        let cancel = CancellationToken::new();
        limiter.throttle(4096, &cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.throttle(1024 * 1024, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must unblock promptly")
            .unwrap();
        assert_eq!(
            result.unwrap_err().kind(),
            crate::error::ErrorKind::Cancelled
        );
    }
}
