use std::sync::Arc;
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind};
use crate::persistence::PersistenceResult;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Fixed-delay retry for `PersistenceTransient` failures. Every other error
/// is returned on the first attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Runs a blocking store call off the async workers, retrying transient
/// failures according to `policy`.
pub async fn with_retry<T, F>(
    policy: RetryPolicy,
    operation: &'static str,
    call: F,
) -> PersistenceResult<T>
where
    T: Send + 'static,
    F: Fn() -> PersistenceResult<T> + Send + Sync + 'static,
{
    let call = Arc::new(call);
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let current = call.clone();
        let result = tokio::task::spawn_blocking(move || current())
            .await
            .map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("persistence worker for '{operation}' failed: {error}"),
                )
            })?;

        match result {
            Err(error) if error.is_transient() && attempt < attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    error = %error,
                    "transient persistence failure; retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
