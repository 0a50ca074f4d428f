use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;
use crate::error::{FaultKind, Result, RouterError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub retry_status_codes: HashSet<u16>,
    pub retry_on: HashSet<FaultKind>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: seconds(config.initial_delay),
            backoff_factor: config.backoff_factor,
            max_delay: seconds(config.max_delay),
            retry_status_codes: config.retry_status_codes.iter().copied().collect(),
            retry_on: config.retry_on.iter().copied().collect(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sleep before the `retry`-th retry (1-based): `min(max, initial * factor^(retry-1))`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    pub fn is_retryable(&self, err: &RouterError) -> bool {
        if let Some(status) = err.upstream_status() {
            return self.retry_status_codes.contains(&status);
        }
        err.fault_kind()
            .is_some_and(|kind| self.retry_on.contains(&kind))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retrying { error: String },
    Failed { error: String },
}

/// One transport attempt as recorded for the call's log.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Backoff slept after this attempt, if another one followed
    pub delay: Option<Duration>,
}

/// Append-only attempt history for a single call.
#[derive(Debug, Clone, Default)]
pub struct AttemptLog {
    attempts: Vec<Attempt>,
}

impl AttemptLog {
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Backoff delays actually slept, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts.iter().filter_map(|a| a.delay).collect()
    }

    fn push(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy's
/// attempt budget is spent. The last error is returned unchanged.
///
/// `op` receives the 1-based attempt number. Dropping the returned future cancels
/// both an in-flight attempt and a pending backoff sleep.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> (Result<T>, AttemptLog)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut log = AttemptLog::default();
    let max_attempts = policy.max_attempts();
    let mut index = 1;

    loop {
        let started_at = Utc::now();
        match op(index).await {
            Ok(value) => {
                log.push(Attempt {
                    index,
                    started_at,
                    outcome: Outcome::Success,
                    delay: None,
                });
                if index > 1 {
                    tracing::info!(route = label, attempts = index, "Upstream call succeeded after retry");
                }
                return (Ok(value), log);
            }
            Err(err) if index < max_attempts && policy.is_retryable(&err) => {
                let delay = policy.delay_for(index);
                tracing::warn!(
                    route = label,
                    attempt = index,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable upstream failure"
                );
                log.push(Attempt {
                    index,
                    started_at,
                    outcome: Outcome::Retrying {
                        error: err.to_string(),
                    },
                    delay: Some(delay),
                });
                tokio::time::sleep(delay).await;
                index += 1;
            }
            Err(err) => {
                tracing::warn!(route = label, attempt = index, error = %err, "Upstream call failed");
                log.push(Attempt {
                    index,
                    started_at,
                    outcome: Outcome::Failed {
                        error: err.to_string(),
                    },
                    delay: None,
                });
                return (Err(err), log);
            }
        }
    }
}
