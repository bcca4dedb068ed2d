//! Retry policy for control requests

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::WriteStreamConfig;
use crate::error::ClientError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WriteStreamConfig) -> Self {
        Self {
            retries: config.retries,
            backoff: config.retry_backoff,
        }
    }

    /// Waits one backoff period unless cancelled first.
    pub async fn backoff(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = sleep(self.backoff) => Ok(()),
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable
    /// error, or the retry budget is spent.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(cancel, ClientError::is_retryable, operation)
            .await
    }

    /// Like [`RetryPolicy::run`], retrying only errors accepted by
    /// `should_retry`.
    pub async fn run_if<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        should_retry: fn(&ClientError) -> bool,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if should_retry(&e) && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Retryable error on attempt {}: {}. Retrying in {:?}",
                        attempt, e, self.backoff
                    );
                    self.backoff(cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
