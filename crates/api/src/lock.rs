//! Bounded, exponentially backed-off lock acquisition.
//!
//! Each attempt runs on the blocking pool: a SQLite backend may wait out its
//! busy timeout inside `acquire_lock`.

use std::sync::Arc;
use std::time::Duration;

use keel_core::StackId;
use keel_persist::{Backend, BackendError, Lease};
use metrics::counter;
use tracing::{debug, warn};

/// Upper bound for a single wait between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay: Duration,
}

impl LockRetry {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self { retries, base_delay }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Whether retry number `attempt` (0-indexed) is within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.retries
    }

    /// Delay before retry `attempt`: `base * 2^attempt`, capped at [`MAX_BACKOFF`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for LockRetry {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Why the lock could not be taken.
#[derive(Debug)]
pub enum AcquireError {
    /// Still held after every retry; carries the last refusal.
    Contended { holder: String, attempts: u32 },
    Backend(BackendError),
}

async fn attempt_once(backend: &Arc<dyn Backend>, scope: &StackId, holder: &str, ttl: Duration) -> Result<Lease, BackendError> {
    let (backend, scope, holder) = (backend.clone(), scope.clone(), holder.to_string());
    tokio::task::spawn_blocking(move || backend.acquire_lock(&scope, &holder, ttl))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "lock attempt aborted");
            Err(BackendError::Poisoned)
        })
}

pub async fn acquire(backend: &Arc<dyn Backend>, scope: &StackId, holder: &str, ttl: Duration, retry: LockRetry) -> Result<Lease, AcquireError> {
    let mut attempt = 0u32;
    loop {
        match attempt_once(backend, scope, holder, ttl).await {
            Ok(lease) => {
                debug!(scope = %scope, holder, attempt, "lock acquired");
                return Ok(lease);
            }
            Err(BackendError::LockHeld { holder: owner, expires_at_ms, .. }) => {
                counter!("lock_contended", 1u64);
                if !retry.should_retry(attempt) {
                    return Err(AcquireError::Contended { holder: owner, attempts: attempt + 1 });
                }
                let wait = retry.delay(attempt);
                warn!(scope = %scope, owner = %owner, expires_at_ms, wait_ms = wait.as_millis() as u64, "lock busy; backing off");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(AcquireError::Backend(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_persist::MemoryBackend;

    #[test]
    fn delays_double_and_cap() {
        let r = LockRetry::new(10, Duration::from_millis(500));
        assert_eq!(r.delay(0), Duration::from_millis(500));
        assert_eq!(r.delay(1), Duration::from_millis(1000));
        assert_eq!(r.delay(3), Duration::from_millis(4000));
        assert_eq!(r.delay(9), MAX_BACKOFF);
        assert!(r.should_retry(9));
        assert!(!r.should_retry(10));
    }

    #[tokio::test]
    async fn contended_lock_gives_up_after_retries() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let scope = StackId::new("bookings", "booker");
        backend.acquire_lock(&scope, "other-run", Duration::from_secs(60)).unwrap();
        let err = acquire(&backend, &scope, "me", Duration::from_secs(60), LockRetry::new(2, Duration::from_millis(1)))
            .await
            .unwrap_err();
        match err {
            AcquireError::Contended { holder, attempts } => {
                assert_eq!(holder, "other-run");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn free_lock_is_taken_first_time() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let scope = StackId::new("bookings", "booker");
        let lease = acquire(&backend, &scope, "me", Duration::from_secs(60), LockRetry::none()).await.unwrap();
        assert_eq!(lease.holder, "me");
    }
}
