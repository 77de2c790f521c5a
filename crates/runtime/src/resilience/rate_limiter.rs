//! Token-bucket rate limiter.
//!
//! The bucket refills continuously at `refill_per_second`; `allow` refills
//! by the elapsed time and then tries to consume one token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::types::ResilienceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub capacity: u64,
    pub refill_per_second: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 1.0,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

pub struct RateLimiter {
    capacity: u64,
    refill_per_second: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            capacity: config.capacity.max(1),
            refill_per_second: config.refill_per_second.max(0.0),
            clock,
            state: Mutex::new(BucketState {
                tokens: config.capacity.max(1) as f64,
                last_refill: now,
            }),
        }
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        self.try_acquire(1).is_ok()
    }

    /// Consume `n` tokens atomically.
    pub fn try_acquire(&self, n: u64) -> Result<(), ResilienceError> {
        if n > self.capacity {
            return Err(ResilienceError::TokensExceedCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock();
        let now = self.clock.now();
        let elapsed = (now - state.last_refill)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_second)
                .min(self.capacity as f64);
            state.last_refill = now;
        }

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded)
        }
    }

    pub fn available(&self) -> f64 {
        self.state.lock().tokens
    }
}
