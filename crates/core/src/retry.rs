use crate::config::RetryOptions;
use crate::error::ProviderError;
use std::future::Future;
use tokio::time::sleep;
use tracing::warn;

/// Runs `call` until it succeeds, fails permanently or exhausts `policy.max_retries`.
///
/// Only errors for which [`ProviderError::is_transient`] holds are retried. Callers must only
/// use this for idempotent requests.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryOptions,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient provider failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
