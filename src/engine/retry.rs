use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::collaborators::assets::AssetError;
use crate::collaborators::settlement::LedgerError;
use crate::collaborators::storage::StoreError;

/// Classifies a collaborator error as worth another attempt or not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

impl Retryable for AssetError {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Why a retried call ultimately gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The call failed in a way retries cannot fix.
    Fatal(E),
    /// Attempts (including timeouts) are exhausted.
    Exhausted {
        what: &'static str,
        attempts: u32,
        last: String,
    },
}

/// One bounded-retry policy shared by every collaborator call path: a fixed
/// per-call timeout ceiling, a capped attempt count, and exponential
/// backoff with jitter between attempts.
///
/// `run` re-issues the call blindly on timeout, so it is only for calls
/// that are idempotent (reads, keyed inserts, ensure-style writes).
/// Non-idempotent writes — the status CAS — go through the engine's own
/// requery loop instead, which re-reads actual state before retrying.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub async fn run<T, E, F, Fut>(&self, what: &'static str, mut call: F) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last = String::new();
        for attempt in 1..=self.max_attempts.max(1) {
            match timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if !err.is_retryable() => return Err(RetryFailure::Fatal(err)),
                Ok(Err(err)) => {
                    warn!(what, attempt, error = %err, "collaborator call failed");
                    last = err.to_string();
                }
                Err(_) => {
                    warn!(what, attempt, "collaborator call timed out");
                    last = format!("timed out after {:?}", self.call_timeout);
                }
            }
            if attempt < self.max_attempts {
                sleep(self.backoff_delay(attempt)).await;
            }
        }
        Err(RetryFailure::Exhausted {
            what,
            attempts: self.max_attempts.max(1),
            last,
        })
    }

    /// Exponential backoff capped at `max_delay`, with up to 25% jitter so
    /// racing sessions do not retry in lockstep.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ceiling = (exp.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        exp + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(3),
        }
    }
}
