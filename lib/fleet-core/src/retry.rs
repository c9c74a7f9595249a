//! Optimistic-concurrency retry loop for read-modify-write cycles.
//!
//! Writes against a versioned store are rejected when the object changed
//! since it was read. [`with_optimistic_retry`] re-runs the whole
//! read-modify-write closure on conflict, with a short jittered backoff, and
//! surfaces the conflict only once the attempt budget is spent.

use crate::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default attempt budget for conflicting writes
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

const INITIAL_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_millis(500);

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` conflicting attempts have been made.
///
/// `operation` must re-read the object on every call; reusing a stale copy
/// would conflict forever.
pub async fn with_optimistic_retry<F, Fut, T>(
    max_attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = INITIAL_DELAY;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = sleep.as_millis() as u64,
                    "Write conflict, re-reading and retrying"
                );
                tokio::time::sleep(sleep).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        "Write conflict persisted after max attempts"
                    );
                }
                return Err(e);
            }
        }
    }
}
