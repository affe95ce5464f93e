//! Local task execution with timeouts, heartbeats and retries.
//!
//! Every unit of scheduler work (one block, one catch-up batch, one head
//! lookup) runs through [`TaskRunner::execute`]. A failed attempt is retried
//! from scratch, so tasks must be idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{RetryConfig, SchedulerConfig};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial value.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.initial_backoff.saturating_mul(factor), self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Limit for one attempt.
    pub timeout: Duration,
    /// Fail the attempt if no heartbeat arrives within this window.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl TaskOptions {
    pub fn block(settings: &SchedulerConfig) -> Self {
        Self {
            timeout: Duration::from_secs(settings.block_timeout_secs),
            heartbeat_timeout: None,
            retry: RetryPolicy::from(&settings.retry),
        }
    }

    pub fn batch(settings: &SchedulerConfig) -> Self {
        Self {
            timeout: Duration::from_secs(settings.batch_timeout_secs),
            heartbeat_timeout: Some(Duration::from_secs(settings.heartbeat_timeout_secs)),
            retry: RetryPolicy::from(&settings.retry),
        }
    }
}

/// Liveness signal handed to long-running tasks.
#[derive(Clone)]
pub struct Heartbeat {
    tx: Arc<watch::Sender<u64>>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.tx.send_modify(|n| *n += 1);
    }
}

enum AttemptError {
    Failed(eyre::Report),
    TimedOut,
    HeartbeatLost,
}

/// Resolves when `window` passes without a beat. Never resolves once the
/// task side is gone.
async fn watchdog(mut rx: watch::Receiver<u64>, window: Option<Duration>) {
    let Some(window) = window else {
        return std::future::pending().await;
    };
    loop {
        match tokio::time::timeout(window, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return std::future::pending().await,
            Err(_) => return,
        }
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    cancel: CancellationToken,
}

impl TaskRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        options: &TaskOptions,
        mut task: F,
    ) -> eyre::Result<T>
    where
        F: FnMut(Heartbeat) -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let max_attempts = options.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let (tx, rx) = watch::channel(0u64);
            let heartbeat = Heartbeat { tx: Arc::new(tx) };

            let outcome = tokio::select! {
                result = tokio::time::timeout(options.timeout, task(heartbeat)) => match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(AttemptError::Failed(e)),
                    Err(_) => Err(AttemptError::TimedOut),
                },
                _ = watchdog(rx, options.heartbeat_timeout) => Err(AttemptError::HeartbeatLost),
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(task = name, attempt, "Task succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(AttemptError::Failed(e)) => e,
                Err(AttemptError::TimedOut) => {
                    eyre::eyre!("timed out after {}s", options.timeout.as_secs())
                }
                Err(AttemptError::HeartbeatLost) => eyre::eyre!("heartbeat timeout"),
            };

            if attempt == max_attempts {
                return Err(error.wrap_err(format!(
                    "Task {} failed after {} attempts",
                    name, max_attempts
                )));
            }

            let delay = options.retry.backoff(attempt);
            tracing::warn!(
                task = name,
                attempt,
                max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Task failed, retrying..."
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Err(error.wrap_err(format!("Task {} cancelled during backoff", name)));
                }
            }
        }

        Err(eyre::eyre!("Task {} was never attempted", name))
    }
}
