use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::ErrorClass;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts that may fail with a transient or corrupt result before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay(),
        }
    }

    /// Backoff after the `failures`-th counted failure: `base * 2^(failures - 1)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Runs `op` until it succeeds or its error class says stop.
///
/// Transient and corrupt-result failures count against `max_attempts` and back off
/// exponentially; a corrupt result's file is deleted first. Rate limits sleep exactly
/// the requested time without consuming an attempt. Permanent and fatal errors are
/// returned at once.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0u32;
    let mut attempt = 0u32;
    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        attempt += 1;
        let err = match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        let wait = match err.class() {
            ErrorClass::RateLimited(seconds) => {
                warn!(event = "retry.rate_limited", label, seconds, "retry.rate_limited");
                Duration::from_secs(seconds)
            }
            ErrorClass::Transient | ErrorClass::CorruptResult => {
                if let Error::CorruptResult { path } = &err {
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(event = "retry.cleanup_failed", label, path = %path.display(), error = %e, "retry.cleanup_failed")
                        }
                    }
                }
                failures += 1;
                if failures >= policy.max_attempts {
                    warn!(event = "retry.exhausted", label, failures, error = %err, "retry.exhausted");
                    return Err(err);
                }
                let delay = policy.delay_for(failures);
                debug!(
                    event = "retry.backoff",
                    label,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retry.backoff"
                );
                delay
            }
            ErrorClass::Permanent | ErrorClass::Fatal => return Err(err),
        };

        match cancel {
            Some(c) => {
                tokio::select! {
                    _ = c.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            None => tokio::time::sleep(wait).await,
        }
    }
}
