//! Bounded retries for transient HTTP failures.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::ForgeError;

/// How often a request is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or the attempts are
    /// spent. Transient failures are not logged above debug level.
    pub async fn run<T, F, Fut>(&self, service: &str, op: F) -> Result<T, ForgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ForgeError>>,
    {
        self.run_while(service, ForgeError::is_transient, op).await
    }

    /// Like [`Self::run`], but only failures accepted by `retryable` are
    /// retried. Non-idempotent requests pass [`ForgeError::is_unsent`].
    pub async fn run_while<T, F, Fut>(
        &self,
        service: &str,
        retryable: fn(&ForgeError) -> bool,
        mut op: F,
    ) -> Result<T, ForgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ForgeError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt < attempts => {
                    debug!(service, attempt, error = %e, "transient failure; retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) if retryable(&e) => {
                    return Err(ForgeError::Exhausted {
                        service: service.to_string(),
                        attempts: attempt,
                        detail: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}
