//! `RetryCore`: exponential-backoff driver with jitter and an exit-code
//! classifier, grounded on the teacher's `jobs::retry::ExponentialBackoff`
//! (same multiplier/jitter shape, generalised to the job-execution exit-code
//! table from spec §4.4).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryConfig {
    /// Base delay before jitter for a failing attempt `k` (0-indexed).
    pub fn base_delay_at_attempt(&self, k: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(k as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// `min(initial_delay * backoff_factor^k, max_delay) + uniform(0, base *
    /// jitter_fraction)` — jitter is strictly additive and positive.
    fn delay_with_jitter(&self, k: u32) -> Duration {
        let base = self.base_delay_at_attempt(k);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let jitter_max = base.as_secs_f64() * self.jitter_fraction;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_max);
        base + Duration::from_secs_f64(jitter)
    }
}

/// `Some(error)` means retryable-but-exhausted-or-in-progress is not this
/// type's job — it reports per-attempt classification. `None` means the
/// attempt succeeded.
pub struct RetryableError {
    pub error: Error,
    pub retryable: bool,
}

/// `ClassifyExecutionError(err, exit_code)` from spec §4.4's table.
pub fn classify_execution_error(err: Option<&Error>, exit_code: Option<i32>) -> Option<RetryableError> {
    if let Some(code) = exit_code {
        return match code {
            0 => None,
            125 => Some(RetryableError { error: Error::ContainerRuntime("container engine failed to start".into()), retryable: true }),
            126 => Some(RetryableError { error: Error::PermissionDenied("permission denied".into()), retryable: false }),
            127 => Some(RetryableError { error: Error::CommandNotFound("command not found".into()), retryable: false }),
            137 => Some(RetryableError { error: Error::OomKilled("process killed (possibly oom)".into()), retryable: true }),
            143 => Some(RetryableError { error: Error::Terminated("terminated (sigterm)".into()), retryable: false }),
            other => Some(RetryableError {
                error: Error::ApplicationError(other, "user code failure".into()),
                retryable: false,
            }),
        };
    }

    match err {
        None => None,
        Some(Error::Cancelled) => Some(RetryableError { error: Error::Cancelled, retryable: false }),
        Some(e) => Some(RetryableError { error: Error::other(e.to_string()), retryable: e.retryable() }),
    }
}

/// `RetryWithBackoffCounter(ctx, cfg, op_name, fn(attempt) -> err)`.
///
/// Invokes `op` with `attempt = 0, 1, 2, …`; attempt 0 is the initial try.
/// Respects cancellation both between attempts and inside the delay. A
/// non-retryable error short-circuits immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    cancel: &tokio_util::sync::CancellationToken,
    cfg: &RetryConfig,
    op_name: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = op(attempt).await;

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.retryable() || attempt >= cfg.max_retries {
                    warn!(op = op_name, attempt, error = %err, "giving up, non-retryable or attempts exhausted");
                    return Err(Error::other(format!(
                        "{} failed after {} attempt(s): {}",
                        op_name,
                        attempt + 1,
                        err
                    )));
                }

                let delay = cfg.delay_with_jitter(attempt);
                info!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn classify_success() {
        assert!(classify_execution_error(None, Some(0)).is_none());
    }

    #[test]
    fn classify_oom_is_retryable() {
        let c = classify_execution_error(None, Some(137)).unwrap();
        assert!(c.retryable);
    }

    #[test]
    fn classify_permission_denied_not_retryable() {
        let c = classify_execution_error(None, Some(126)).unwrap();
        assert!(!c.retryable);
    }

    #[test]
    fn classify_application_error_not_retryable() {
        let c = classify_execution_error(None, Some(3)).unwrap();
        assert!(!c.retryable);
    }

    #[test]
    fn base_delay_respects_max_delay_cap() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_fraction: 0.0,
        };
        assert_eq!(cfg.base_delay_at_attempt(0), Duration::from_secs(1));
        assert_eq!(cfg.base_delay_at_attempt(1), Duration::from_secs(2));
        assert_eq!(cfg.base_delay_at_attempt(2), Duration::from_secs(4));
        assert_eq!(cfg.base_delay_at_attempt(3), Duration::from_secs(5)); // capped
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = tokio_util::sync::CancellationToken::new();
        let cfg = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_fraction: 0.0,
            ..Default::default()
        };

        let a = attempts.clone();
        let result: Result<&str, Error> = retry_with_backoff(&cancel, &cfg, "test-op", move |attempt| {
            let a = a.clone();
            async move {
                a.store(attempt, Ordering::SeqCst);
                if attempt < 2 {
                    Err(Error::ContainerRuntime("transient".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let cancel = tokio_util::sync::CancellationToken::new();
        let cfg = RetryConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), Error> = retry_with_backoff(&cancel, &cfg, "test-op", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::PermissionDenied("nope".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
