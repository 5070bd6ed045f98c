//! Transient-error retry wrapper for SQL statements.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::is_transient;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Run a statement up to three times with linear backoff
/// (100 ms × attempt). Only transient errors are retried; anything else
/// returns on the first attempt.
pub async fn execute_with_retry<T, F, Fut>(operation: &str, mut run: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < MAX_ATTEMPTS && is_transient(&error) => {
                warn!(
                    operation,
                    attempt,
                    error = %error,
                    "transient database error, retrying"
                );
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
