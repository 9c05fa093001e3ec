//! Bounded exponential backoff around KMS calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use common::EkpError;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Delay before re-attempt number `attempt` (1-based): `base * 2^(attempt-1)`
/// capped, plus up to 25% random jitter.
fn backoff_delay(attempt: i64) -> Duration {
    let exp = (attempt - 1).clamp(0, 16) as u32;
    let base = BACKOFF_BASE_MS.saturating_mul(1 << exp).min(BACKOFF_MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// exhausts `retry_budget` re-attempts.
///
/// `on_retry` fires before each re-attempt (tracing hook). Only errors in
/// the retryable set ([`EkpError::is_retryable`]) are eligible for backoff;
/// everything else is rethrown immediately. A budget of `n` allows `n + 1`
/// attempts in total.
pub async fn kms_request_with_backoff<T, F, Fut, R>(
    mut attempt: F,
    mut on_retry: R,
    op: &'static str,
    retry_budget: i64,
) -> Result<T, EkpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EkpError>>,
    R: FnMut(),
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retries < retry_budget => {
                retries += 1;
                on_retry();
                let delay = backoff_delay(retries);
                debug!(
                    op,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "KMS request failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
