//! Delivery success/failure tally shared by all sessions of a backend.

use serde::Serialize;
use tokio::sync::Mutex;

/// A point-in-time copy of the delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub success: u64,
    pub failure: u64,
}

/// Monotonic delivery counters guarded by a single mutex.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    counts: Mutex<Counts>,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished transaction as a success or a failure.
    pub async fn record_outcome<T, E>(&self, result: &Result<T, E>) {
        let mut counts = self.counts.lock().await;
        match result {
            Ok(_) => counts.success += 1,
            Err(_) => counts.failure += 1,
        }
    }

    /// Count a failure that happened before any delivery was attempted.
    pub async fn record_failure(&self) {
        self.counts.lock().await.failure += 1;
    }

    pub async fn snapshot(&self) -> Counts {
        *self.counts.lock().await
    }
}
