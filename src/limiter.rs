// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Byte-rate cap shared by every fetch of the engine.
///
/// A token bucket whose capacity equals one second of traffic. A rate of 0
/// disables it entirely: `acquire` returns immediately without locking.
#[derive(Clone, Debug)]
pub struct BandwidthLimiter {
    bucket: Option<Arc<Mutex<Bucket>>>,
}

#[derive(Debug)]
struct Bucket {
    rate: u64,
    available: u64,
    refilled_at: Instant,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let bucket = (bytes_per_sec > 0).then(|| {
            Arc::new(Mutex::new(Bucket {
                rate: bytes_per_sec,
                available: bytes_per_sec,
                refilled_at: Instant::now(),
            }))
        });
        Self { bucket }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Waits until `bytes` may pass. Chunks larger than the bucket are let
    /// through in bucket-sized slices.
    pub async fn acquire(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut b = bucket.lock().await;
                b.refill();
                let take = remaining.min(b.available);
                b.available -= take;
                remaining -= take;
                if remaining == 0 {
                    return;
                }
                let needed = remaining.min(b.rate);
                Duration::from_secs_f64(needed as f64 / b.rate as f64)
            };
            // Lock released before sleeping so other fetches can refill too.
            tokio::time::sleep(wait).await;
        }
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let earned = (now.duration_since(self.refilled_at).as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.available = (self.available + earned).min(self.rate);
            self.refilled_at = now;
        }
    }
}
