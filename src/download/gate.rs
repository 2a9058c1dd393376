//! Coordinated retry with a shared cooldown.
//!
//! This module provides the [`RetryGate`], a combinator that retries
//! transient failures with exponential backoff, sharing the backoff
//! state across *all* concurrent callers of the same wrapped operation.
//! When N in-flight fetches hit the same failing endpoint, independent
//! per-call backoff produces a staggered retry storm; the shared cooldown
//! produces one coordinated pause-and-resume cycle.
//!
//! # Algorithm
//!
//! The gate keeps `{next_allowed_at, consecutive_failures}` plus a single
//! admission lock, shared per wrapped operation (never per call):
//!
//! 1. While the cooldown deadline is in the future, acquire then immediately
//!    release the admission lock (this parks the caller until whichever
//!    call owns the cooldown has finished sleeping), then re-check.
//! 2. Attempt the operation. Success resets the failure counter.
//! 3. On a transient failure, take the admission lock. If another caller
//!    already advanced the deadline, release and go back to step 1. Otherwise
//!    bump the failure counter (failing permanently once it exceeds the
//!    retry budget), set the deadline, and sleep out the delay *while still
//!    holding the lock*.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use workdl_core::download::{GateError, Retryable, RetryGate};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("flaky")]
//! struct Flaky;
//! impl Retryable for Flaky {
//!     fn is_transient(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), GateError<Flaky>> {
//! let gate = RetryGate::new(Duration::from_secs(2), 5);
//! let value = gate.run(|| async { Ok::<_, Flaky>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Classifies an error as worth retrying or not.
///
/// Implemented by the error types that cross the gate (API calls, file
/// fetches). Permanent errors pass straight through without touching the
/// cooldown state.
pub trait Retryable {
    /// Returns true when a retry may succeed (network hiccups, 5xx).
    fn is_transient(&self) -> bool;
}

/// Failure surfaced by [`RetryGate::run`].
#[derive(Debug, Error)]
pub enum GateError<E> {
    /// The operation failed with a non-transient error; no retry attempted.
    #[error("permanent failure: {0}")]
    Permanent(#[source] E),

    /// The shared retry budget is exhausted.
    #[error("giving up after {retries} retries: {source}")]
    Exhausted {
        /// The configured retry budget.
        retries: u32,
        /// The last transient error observed by this caller.
        #[source]
        source: E,
    },
}

/// Timing fields of the shared state; guarded by a std mutex that is only
/// held for plain reads and writes, never across an await point.
#[derive(Debug, Default)]
struct Timing {
    next_allowed_at: Option<Instant>,
    consecutive_failures: u32,
}

/// Backoff state shared by every concurrent caller of one wrapped operation.
#[derive(Debug, Default)]
struct CooldownState {
    timing: StdMutex<Timing>,
    /// Admission lock; held across the backoff sleep so that concurrent
    /// callers queue behind the cooldown owner instead of retrying.
    gate: Mutex<()>,
}

/// Outcome of registering a failure under the admission lock.
enum Backoff {
    /// Another caller already owns a live cooldown.
    AlreadyCooling,
    /// The retry budget is spent.
    Exhausted,
    /// This caller owns the new cooldown and must sleep it out.
    Sleep(Duration),
}

/// Retry combinator with shared, coordinated exponential backoff.
///
/// Clone-cheap via an internal `Arc`: clones share the same cooldown state,
/// which is what makes coordination across tasks work. Construct one gate
/// per remote operation kind.
#[derive(Debug, Clone)]
pub struct RetryGate {
    state: Arc<CooldownState>,
    base_delay: Duration,
    max_retries: u32,
}

impl RetryGate {
    /// Creates a gate with the given backoff base and retry budget.
    #[must_use]
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            state: Arc::new(CooldownState::default()),
            base_delay,
            max_retries,
        }
    }

    /// Runs `op`, retrying transient failures under the shared cooldown.
    ///
    /// `op` is a factory invoked once per attempt.
    ///
    /// # Errors
    ///
    /// [`GateError::Permanent`] for non-transient failures;
    /// [`GateError::Exhausted`] once the shared failure counter exceeds the
    /// retry budget.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, GateError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            // Step 1: park behind an in-progress cooldown.
            while self.cooling_down() {
                let _held = self.state.gate.lock().await;
            }

            // Step 2: attempt.
            match op().await {
                Ok(value) => {
                    self.timing(|t| t.consecutive_failures = 0);
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(GateError::Permanent(e)),
                Err(e) => {
                    // Step 3: claim or defer to the cooldown.
                    let held = self.state.gate.lock().await;
                    match self.register_failure() {
                        Backoff::AlreadyCooling => {
                            drop(held);
                        }
                        Backoff::Exhausted => {
                            drop(held);
                            return Err(GateError::Exhausted {
                                retries: self.max_retries,
                                source: e,
                            });
                        }
                        Backoff::Sleep(delay) => {
                            warn!(
                                delay_ms = delay.as_millis(),
                                error = %e,
                                "transient failure, holding all callers back"
                            );
                            tokio::time::sleep(delay).await;
                            drop(held);
                        }
                    }
                }
            }
        }
    }

    /// Returns the number of consecutive failures currently recorded.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.timing(|t| t.consecutive_failures)
    }

    fn cooling_down(&self) -> bool {
        let now = Instant::now();
        self.timing(|t| t.next_allowed_at.is_some_and(|at| at > now))
    }

    /// Advances the failure counter and cooldown deadline; call only while
    /// holding the admission lock.
    fn register_failure(&self) -> Backoff {
        let now = Instant::now();
        self.timing(|t| {
            if t.next_allowed_at.is_some_and(|at| at > now) {
                return Backoff::AlreadyCooling;
            }
            t.consecutive_failures += 1;
            if t.consecutive_failures > self.max_retries {
                return Backoff::Exhausted;
            }
            let exponent = (t.consecutive_failures - 1).min(20);
            let delay = self.base_delay.saturating_mul(1 << exponent);
            t.next_allowed_at = Some(now + delay);
            debug!(
                failures = t.consecutive_failures,
                delay_ms = delay.as_millis(),
                "cooldown armed"
            );
            Backoff::Sleep(delay)
        })
    }

    fn timing<R>(&self, f: impl FnOnce(&mut Timing) -> R) -> R {
        // Poisoning cannot leave Timing inconsistent; recover the guard.
        let mut guard = self
            .state
            .timing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}
