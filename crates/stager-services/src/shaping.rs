//! Bandwidth shaping — per-request token bucket, adjustable at runtime.
//!
//! A request with no limit is never throttled. Limits are set at submission
//! (config default) or later through the control API, and each transferred
//! block costs its size in tokens. An empty bucket makes the task wait, not
//! drop — staging is loss-intolerant.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Burst capacity, in seconds' worth of the configured rate.
const BURST_SECS: f64 = 0.5;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        let capacity = (rate * BURST_SECS).max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    /// Take `n` tokens if available, else return how long to wait for them.
    fn take(&mut self, n: u64) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        let need = n as f64;
        if self.tokens >= need {
            self.tokens -= need;
            None
        } else {
            let deficit = need - self.tokens;
            // Debt is taken now; the wait covers the refill.
            self.tokens -= need;
            Some(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }
}

/// Shared gate the engine consults before each I/O block.
#[derive(Clone, Default)]
pub struct ShapingGate {
    limits: std::sync::Arc<DashMap<u64, std::sync::Mutex<TokenBucket>>>,
}

impl ShapingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace the limit for a request. 0 removes the limit.
    pub fn set_limit(&self, request_id: u64, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            self.limits.remove(&request_id);
            tracing::info!(request_id, "bandwidth shaping removed");
        } else {
            self.limits
                .insert(request_id, std::sync::Mutex::new(TokenBucket::new(bytes_per_sec)));
            tracing::info!(request_id, bytes_per_sec, "bandwidth shaping set");
        }
    }

    pub fn limit(&self, request_id: u64) -> Option<u64> {
        self.limits
            .get(&request_id)
            .map(|b| b.lock().unwrap_or_else(|p| p.into_inner()).refill_rate as u64)
    }

    /// Forget a finished request's bucket.
    pub fn clear(&self, request_id: u64) {
        self.limits.remove(&request_id);
    }

    /// Wait until `bytes` may be transferred for this request.
    pub async fn throttle(&self, request_id: u64, bytes: u64) {
        let wait = self
            .limits
            .get(&request_id)
            .and_then(|b| b.lock().unwrap_or_else(|p| p.into_inner()).take(bytes));
        if let Some(delay) = wait {
            tokio::time::sleep(delay).await;
        }
    }
}
