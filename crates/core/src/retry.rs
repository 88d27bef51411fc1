use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::UploadConfig;
use crate::{Error, Result};

/// Idle retry states older than this are dropped by `cleanup_expired_states`.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(60 * 60);

const EXPONENTIAL_CAP_MS: u64 = 30_000;
const LINEAR_CAP_MS: u64 = 10_000;

const RETRYABLE_MESSAGES: &[&str] = &[
    "network error",
    "fetch failed",
    "failed to fetch",
    "connection timeout",
    "request timeout",
    "connection reset",
    "connection refused",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for RetryConfig {
    fn from(c: &UploadConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            backoff_multiplier: c.backoff_multiplier,
        }
    }
}

impl RetryConfig {
    /// Delay before the next try after `attempt` failures (`attempt >= 1`).
    pub fn delay_for(&self, attempt: u32, strategy: BackoffStrategy) -> Duration {
        let base = self.retry_delay.as_millis() as u64;
        let n = attempt.max(1);
        let ms = match strategy {
            BackoffStrategy::Exponential => {
                let factor = self.backoff_multiplier.powi(n as i32 - 1);
                let ms = base as f64 * factor;
                if ms.is_finite() {
                    (ms as u64).min(EXPONENTIAL_CAP_MS)
                } else {
                    EXPONENTIAL_CAP_MS
                }
            }
            BackoffStrategy::Linear => base.saturating_mul(n as u64).min(LINEAR_CAP_MS),
            BackoffStrategy::Fixed => base,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub task_id: String,
    pub attempts: Vec<RetryAttempt>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub is_retrying: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    pub total_tasks: u64,
    pub retrying_tasks: u64,
    /// Tasks that ran out of budget since the manager was created.
    pub failed_tasks: u64,
    /// Failed attempts recorded since the manager was created.
    pub total_attempts: u64,
}

struct Entry {
    state: RetryState,
    cancel: CancellationToken,
}

/// Classification-aware retry with backoff, keyed by task id.
pub struct RetryManager {
    config: RetryConfig,
    states: Mutex<HashMap<String, Entry>>,
    failed_tasks: AtomicU64,
    total_attempts: AtomicU64,
}

/// Whether an error message names a transient network or server condition.
pub fn should_retry(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_MESSAGES.iter().any(|p| message.contains(p))
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            failed_tasks: AtomicU64::new(0),
            total_attempts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn should_retry(&self, error: &Error) -> bool {
        should_retry(&error.to_string())
    }

    /// Runs `task` until it succeeds, fails with a non-retryable error, or
    /// `max_retries` attempts have failed. Concurrent calls for the same
    /// `task_id` are rejected with `Error::RetryInProgress`.
    pub async fn retry<T, F, Fut>(
        &self,
        task_id: &str,
        strategy: BackoffStrategy,
        mut task: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cancel = self.begin(task_id)?;

        loop {
            let err = match task().await {
                Ok(v) => {
                    self.clear(task_id);
                    return Ok(v);
                }
                Err(e) => e,
            };

            let message = err.to_string();
            let Some(attempt) = self.record_attempt(task_id, &message) else {
                // cancel_retry or destroy dropped the task mid-attempt
                return Err(Error::Cancelled);
            };

            if !self.should_retry(&err) {
                self.clear(task_id);
                return Err(err);
            }

            if attempt >= self.config.max_retries {
                self.clear(task_id);
                self.failed_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "retry.exhausted",
                    task_id,
                    attempts = attempt,
                    error = %message,
                    "retry.exhausted"
                );
                return Err(Error::RetryBudgetExhausted {
                    task_id: task_id.to_string(),
                    last_error: message,
                });
            }

            let delay = self.config.delay_for(attempt, strategy);
            self.schedule(task_id, delay);
            debug!(
                event = "retry.scheduled",
                task_id,
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "retry.scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.clear(task_id);
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Cancels a pending delayed retry and forgets the task's history.
    pub fn cancel_retry(&self, task_id: &str) {
        if let Some(entry) = self.lock().remove(task_id) {
            entry.cancel.cancel();
            debug!(event = "retry.cancelled", task_id, "retry.cancelled");
        }
    }

    /// Cancels every task whose id contains `fragment`. Returns how many.
    pub fn cancel_matching(&self, fragment: &str) -> usize {
        let mut states = self.lock();
        let ids: Vec<String> = states
            .keys()
            .filter(|id| id.contains(fragment))
            .cloned()
            .collect();
        for id in &ids {
            if let Some(entry) = states.remove(id) {
                entry.cancel.cancel();
            }
        }
        ids.len()
    }

    pub fn retry_state(&self, task_id: &str) -> Option<RetryState> {
        self.lock().get(task_id).map(|e| e.state.clone())
    }

    pub fn retry_states(&self) -> Vec<RetryState> {
        self.lock().values().map(|e| e.state.clone()).collect()
    }

    pub fn retry_stats(&self) -> RetryStats {
        let states = self.lock();
        RetryStats {
            total_tasks: states.len() as u64,
            retrying_tasks: states.values().filter(|e| e.state.is_retrying).count() as u64,
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
        }
    }

    /// Drops idle states whose last attempt is older than `max_idle`.
    pub fn cleanup_expired_states(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return 0;
        };
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, e| {
            e.state.is_retrying
                || e.state
                    .attempts
                    .last()
                    .is_none_or(|a| a.timestamp >= cutoff)
        });
        before - states.len()
    }

    pub fn destroy(&self) {
        let mut states = self.lock();
        for entry in states.values() {
            entry.cancel.cancel();
        }
        states.clear();
    }

    fn begin(&self, task_id: &str) -> Result<CancellationToken> {
        let mut states = self.lock();
        let entry = states.entry(task_id.to_string()).or_insert_with(|| Entry {
            state: RetryState {
                task_id: task_id.to_string(),
                attempts: Vec::new(),
                next_retry_at: None,
                is_retrying: false,
            },
            cancel: CancellationToken::new(),
        });

        if entry.state.is_retrying {
            return Err(Error::RetryInProgress {
                task_id: task_id.to_string(),
            });
        }
        if entry.state.attempts.len() as u32 >= self.config.max_retries {
            let last_error = entry
                .state
                .attempts
                .last()
                .map(|a| a.error.clone())
                .unwrap_or_default();
            states.remove(task_id);
            return Err(Error::RetryBudgetExhausted {
                task_id: task_id.to_string(),
                last_error,
            });
        }

        entry.state.is_retrying = true;
        Ok(entry.cancel.clone())
    }

    /// None when the task's state was removed while the attempt ran.
    fn record_attempt(&self, task_id: &str, message: &str) -> Option<u32> {
        let mut states = self.lock();
        let entry = states.get_mut(task_id)?;
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        let attempt = entry.state.attempts.len() as u32 + 1;
        entry.state.attempts.push(RetryAttempt {
            attempt,
            error: message.to_string(),
            timestamp: Utc::now(),
            delay_ms: 0,
        });
        Some(attempt)
    }

    fn schedule(&self, task_id: &str, delay: Duration) {
        let mut states = self.lock();
        if let Some(entry) = states.get_mut(task_id) {
            if let Some(last) = entry.state.attempts.last_mut() {
                last.delay_ms = delay.as_millis() as u64;
            }
            entry.state.next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
        }
    }

    fn clear(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
