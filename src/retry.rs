//! Async retry executor shared by the fetcher and the summarizer.
//!
//! Wraps any fallible async operation with the backoff schedule of a
//! [`RetryPolicy`]. Which errors are worth retrying is decided by a predicate
//! passed per call, so one executor serves HTTP fetches (connect errors,
//! timeouts, 5xx) and model calls (transient backend errors) alike.
//!
//! Every attempt is recorded as an [`Attempt`]; the record lives only as long
//! as the call and is handed back inside [`RetryError`] on failure. Both the
//! operation and the backoff sleep race the caller's [`CancellationToken`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use distill_core::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed with a retryable error.
    Transient(String),
    /// Failed with an error that is not retried.
    Fatal(String),
}

/// Transient record of one try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    pub outcome: AttemptOutcome,
    /// Wait before the next attempt, if there is one.
    pub delay: Option<Duration>,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: Vec<Attempt>, last: E },
    /// An attempt failed with an error the predicate rejected.
    Fatal { attempts: Vec<Attempt>, error: E },
    /// The cancellation token fired.
    Cancelled { attempts: Vec<Attempt> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Fatal { attempts, .. }
            | RetryError::Cancelled { attempts } => attempts,
        }
    }

    /// Total time spent waiting between attempts.
    pub fn total_delay(&self) -> Duration {
        self.attempts().iter().filter_map(|a| a.delay).sum()
    }

    /// The underlying error, unless the call was cancelled.
    pub fn into_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Runs operations under a [`RetryPolicy`] and a cancellation token.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `op` until it succeeds, fails fatally, exhausts the policy, or is
    /// cancelled. `op` receives the 1-based attempt number. `what` labels
    /// log lines.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        what: &str,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut number = 0u32;

        loop {
            number += 1;
            if self.cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }

            let result = tokio::select! {
                r = op(number) => r,
                () = self.cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts });
                }
            };

            let error = match result {
                Ok(value) => {
                    tracing::debug!(what, attempt = number, "attempt succeeded");
                    attempts.push(Attempt {
                        number,
                        outcome: AttemptOutcome::Succeeded,
                        delay: None,
                    });
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                tracing::debug!(what, attempt = number, error = %error, "non-retryable failure");
                attempts.push(Attempt {
                    number,
                    outcome: AttemptOutcome::Fatal(error.to_string()),
                    delay: None,
                });
                return Err(RetryError::Fatal { attempts, error });
            }

            if !self.policy.allows_retry_after(number) {
                tracing::warn!(what, attempts = number, error = %error, "retries exhausted");
                attempts.push(Attempt {
                    number,
                    outcome: AttemptOutcome::Transient(error.to_string()),
                    delay: None,
                });
                return Err(RetryError::Exhausted {
                    attempts,
                    last: error,
                });
            }

            let delay = self.policy.delay(number, rand::random::<f64>());
            tracing::warn!(
                what,
                attempt = number,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            attempts.push(Attempt {
                number,
                outcome: AttemptOutcome::Transient(error.to_string()),
                delay: Some(delay),
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts });
                }
            }
        }
    }
}
