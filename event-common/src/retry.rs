use std::future::Future;
use std::time;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// A bounded retry policy with a fixed delay between attempts.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Never less than 1.
    max_attempts: u32,
    /// How long to wait after a failed attempt.
    delay: time::Duration,
}

#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    #[error("cancelled before an attempt succeeded")]
    Cancelled,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> time::Duration {
        self.delay
    }

    /// Whether a new attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sleep for the retry delay, returning `false` if `token` is cancelled first.
    pub async fn wait(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }

    /// Run `operation` until it succeeds, the attempt budget is spent, or `token` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `token`: Cancellation token checked between attempts.
    /// * `what`: Label used in log lines.
    /// * `operation`: Called once per attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        what: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(attempt) => {
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, self.delay, error
                    );
                    if !self.wait(token).await {
                        return Err(RetryError::Cancelled);
                    }
                }
                Err(error) => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    })
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: time::Duration::from_secs(5),
        }
    }
}
