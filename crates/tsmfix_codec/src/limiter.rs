//! Byte-rate limiter for compaction writes.

use std::time::{Duration, Instant};

/// Token-bucket rate limiter.
///
/// Callers account for bytes about to be written with [`take`](Self::take);
/// when the bucket is empty the call sleeps until enough tokens have
/// accumulated. Bursts up to `burst` bytes pass without waiting.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    burst: u64,
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter with the given sustained throughput and burst size.
    pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
        Self {
            bytes_per_sec,
            burst: burst.max(1),
            available: burst.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    /// Accounts for `bytes` about to be written, sleeping if the budget is
    /// exhausted.
    pub fn take(&mut self, bytes: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }

        let mut remaining = bytes as f64;
        while remaining > 0.0 {
            self.refill();

            if self.available > 0.0 {
                let spent = remaining.min(self.available);
                self.available -= spent;
                remaining -= spent;
                continue;
            }

            // Sleep long enough for at least one refill step.
            let wait = (remaining.min(self.burst as f64) / self.bytes_per_sec as f64)
                .clamp(0.001, 1.0);
            std::thread::sleep(Duration::from_secs_f64(wait));
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available =
            (self.available + elapsed * self.bytes_per_sec as f64).min(self.burst as f64);
    }
}
