//! Token-bucket bandwidth throttle shared by all in-flight downloads.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
}

/// Token bucket: tokens are bytes, refilled at the configured rate. A
/// chunk write awaits until enough tokens accumulate.
#[derive(Debug)]
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `limit_mbps` is megabits per second; the bucket holds one second of
    /// tokens.
    pub fn new(limit_mbps: f64) -> Self {
        let rate = (limit_mbps * 1_000_000.0 / 8.0).max(1.0);
        Self {
            rate_bytes_per_sec: rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                available: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until `bytes` tokens are available, then consume them. Chunks
    /// larger than the bucket drain it fully and pay the remainder in wait
    /// time.
    pub async fn acquire(&self, bytes: usize) {
        let mut needed = bytes as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.available =
                    (state.available + elapsed * self.rate_bytes_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.available >= needed {
                    state.available -= needed;
                    return;
                }
                // Drain what is there and wait for the rest.
                needed -= state.available;
                state.available = 0.0;
                Duration::from_secs_f64(needed / self.rate_bytes_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Optional throttle: absent configuration means unthrottled writes.
#[derive(Debug, Default)]
pub struct BandwidthLimiter {
    bucket: Option<TokenBucket>,
}

impl BandwidthLimiter {
    pub fn from_limit(limit_mbps: Option<f64>) -> Self {
        Self {
            bucket: limit_mbps.filter(|mbps| *mbps > 0.0).map(TokenBucket::new),
        }
    }

    pub async fn acquire(&self, bytes: usize) {
        if let Some(bucket) = &self.bucket {
            bucket.acquire(bytes).await;
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::from_limit(None);
        assert!(!limiter.is_limited());
        limiter.acquire(usize::MAX).await;
    }

    #[tokio::test]
    async fn test_bucket_admits_within_capacity_immediately() {
        let bucket = TokenBucket::new(8.0); // 1 MB/s, 1 MB capacity
        let started = Instant::now();
        bucket.acquire(500_000).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(8.0); // 1 MB/s
        bucket.acquire(1_000_000).await; // drain
        let started = Instant::now();
        bucket.acquire(500_000).await; // needs ~0.5 s of refill
        assert!(started.elapsed() >= Duration::from_millis(450));
    }
}
