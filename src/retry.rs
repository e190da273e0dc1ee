//! Bounded retry with a fixed inter-attempt delay.
//!
//! Every polling operation in this crate (DHCP lease lookups, remote channel
//! readiness) goes through [`retry_after`]. Constant delay, no backoff.

use std::time::Duration;

use anyhow::Result;
use tracing::debug;

/// Marker error for failures that may resolve on a later attempt.
///
/// [`retry_after`] retries an operation only when its error downcasts to
/// `Retriable`; any other error is treated as terminal and propagated
/// immediately.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Retriable(pub String);

/// Invoke `op` up to `attempts` times, sleeping `delay` between attempts.
///
/// Returns the first success. A non-[`Retriable`] error is returned
/// immediately without consuming the remaining budget. If every attempt
/// fails retriably, the final attempt's error is returned.
pub async fn retry_after<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    debug_assert!(attempts > 0, "retry_after needs at least one attempt");

    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is::<Retriable>() => {
                debug!(attempt, attempts, error = %e, "attempt failed, will retry");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.expect("at least one attempt was made"))
}
