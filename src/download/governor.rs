//! Global concurrency and rate budget for remote calls.
//!
//! This module provides the [`ConcurrencyGovernor`], a combinator that bounds
//! how many wrapped operations run at once and spaces their completions so
//! sustained throughput stays under a configured rate.
//!
//! # Overview
//!
//! The governor holds an admission semaphore of capacity `N`. A permit is
//! acquired before the operation runs; on acquisition a release deadline of
//! `now + N/R` is computed, and the permit is not returned until that
//! deadline has passed. With all `N` slots cycling, sustained throughput
//! converges on `R` operations per second. This is a coarse leaky bucket: it
//! does not smooth bursts shorter than one `N/R` window.
//!
//! One governor is shared per remote operation kind (catalog calls, file
//! fetches), never per item, so the budget is global across a batch.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use workdl_core::download::ConcurrencyGovernor;
//!
//! # async fn example() {
//! let governor = Arc::new(ConcurrencyGovernor::new(4, 8.0));
//! let value = governor.run(async { 41 + 1 }).await;
//! assert_eq!(value, 42);
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

/// Bounds in-flight remote calls and caps their sustained rate.
///
/// Designed to be wrapped in `Arc` and shared across tokio tasks; `run` takes
/// `&self` and never requires exclusive access.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    semaphore: Arc<Semaphore>,
    /// Minimum wall-clock time one slot is occupied (`N/R`).
    slot_time: Duration,
    limit: usize,
}

impl ConcurrencyGovernor {
    /// Creates a governor admitting `limit` concurrent operations at no more
    /// than `max_rate` completions per second.
    ///
    /// A non-positive `max_rate` disables the rate budget; the semaphore
    /// alone still bounds concurrency.
    #[must_use]
    pub fn new(limit: usize, max_rate: f64) -> Self {
        let limit = limit.max(1);
        let slot_time = if max_rate > 0.0 {
            Duration::from_secs_f64(limit as f64 / max_rate)
        } else {
            Duration::ZERO
        };
        debug!(limit, slot_ms = slot_time.as_millis(), "creating governor");
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            slot_time,
            limit,
        }
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Runs `op` under the governor's admission and rate budget.
    ///
    /// Suspends until a slot is free, runs `op`, then holds the slot until
    /// its release deadline before returning the result.
    pub async fn run<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed while the governor is alive.
        #[allow(clippy::expect_used)]
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("governor semaphore closed");

        let release_at = Instant::now() + self.slot_time;
        let result = op.await;
        tokio::time::sleep_until(release_at).await;
        result
    }
}
