//! Bulkhead: a named bound on concurrently executing operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::ResilienceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    pub name: String,
    pub capacity: u32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: 32,
        }
    }
}

pub struct Bulkhead {
    name: String,
    capacity: u32,
    in_flight: Arc<AtomicU32>,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            name: config.name,
            capacity: config.capacity.max(1),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim a slot, or fail with the bulkhead-full sentinel. The slot is
    /// released when the permit drops.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, ResilienceError> {
        let admitted = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .is_ok();

        if admitted {
            Ok(BulkheadPermit {
                in_flight: Arc::clone(&self.in_flight),
            })
        } else {
            Err(ResilienceError::BulkheadFull {
                name: self.name.clone(),
            })
        }
    }
}

#[derive(Debug)]
pub struct BulkheadPermit {
    in_flight: Arc<AtomicU32>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
