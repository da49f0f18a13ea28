//! Mutual exclusion over named resources.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{LockError, LockResult};
use crate::store::ConditionalStore;

/// Default wall-clock ownership token: the current time in milliseconds.
///
/// Adequate only when acquisitions from the same process never race within
/// the same millisecond. Callers needing stronger uniqueness should supply
/// their own token, a random identifier for example.
pub fn timestamp_token() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Distributed mutual-exclusion lock manager.
///
/// All coordination state lives in the store, so any number of instances
/// across tasks and processes are interchangeable: the process releasing a
/// lock does not have to be the one that acquired it, only the token is
/// checked.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ConditionalStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ConditionalStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock once. True iff this call created the key.
    ///
    /// Losing the race is a normal outcome signaled by the return value,
    /// never an error. `ttl` bounds the damage of a crashed holder; choose
    /// it to exceed the expected critical-section duration plus clock and
    /// network skew margin.
    pub async fn acquire(&self, lock_key: &str, token: &str, ttl: Duration) -> LockResult<bool> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }

        let acquired = self.store.put_if_absent(lock_key, token, ttl).await?;
        debug!(key = %lock_key, acquired, "Lock acquire attempt");
        Ok(acquired)
    }

    /// Release the lock iff `token` still owns it.
    ///
    /// False means the key was absent or held by a different token: the
    /// caller already lost the lock (TTL expiry, for instance) and must
    /// treat its work since then as unprotected.
    pub async fn release(&self, lock_key: &str, token: &str) -> LockResult<bool> {
        let released = self.store.delete_if_equal(lock_key, token).await?;
        debug!(key = %lock_key, released, "Lock release attempt");
        Ok(released)
    }

    /// Reset the lock's expiry to `ttl` from now iff `token` still owns it.
    pub async fn extend(&self, lock_key: &str, token: &str, ttl: Duration) -> LockResult<bool> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }

        let extended = self.store.refresh_if_equal(lock_key, token, ttl).await?;
        debug!(key = %lock_key, extended, "Lock extend attempt");
        Ok(extended)
    }

    /// Advisory existence check.
    ///
    /// The state may change immediately after the call returns; never a
    /// substitute for [`acquire`](Self::acquire)'s atomic test-and-set.
    pub async fn is_locked(&self, lock_key: &str) -> LockResult<bool> {
        self.store.exists(lock_key).await
    }

    /// Advisory read of the current owner token, if any. Same raciness
    /// caveat as [`is_locked`](Self::is_locked).
    pub async fn owner_token(&self, lock_key: &str) -> LockResult<Option<String>> {
        self.store.read(lock_key).await
    }

    /// Poll [`acquire`](Self::acquire) at a flat `poll_interval` until it
    /// succeeds or `timeout` has elapsed from the call's start.
    ///
    /// Busy-polling is deliberate: hold times are expected to be short and
    /// polling avoids a separate notification channel. Returns false no
    /// earlier than `timeout` and no later than `timeout` plus one poll
    /// interval.
    pub async fn wait_for(
        &self,
        lock_key: &str,
        token: &str,
        ttl: Duration,
        poll_interval: Duration,
        timeout: Duration,
    ) -> LockResult<bool> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        if poll_interval.is_zero() {
            return Err(LockError::InvalidPollInterval);
        }

        let started = Instant::now();
        loop {
            if self.acquire(lock_key, token, ttl).await? {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                debug!(
                    key = %lock_key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Lock wait timed out"
                );
                return Ok(false);
            }
            sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn manager() -> (MemoryStore, LockManager) {
        let store = MemoryStore::new();
        let locks = LockManager::new(Arc::new(store.clone()));
        (store, locks)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (_, locks) = manager();

        assert!(locks
            .acquire("job:42", "A", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!locks
            .acquire("job:42", "B", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!locks.release("job:42", "B").await.unwrap());
        assert!(locks.release("job:42", "A").await.unwrap());
        assert!(!locks.is_locked("job:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_absent_lock_is_false_not_error() {
        let (_, locks) = manager();

        assert!(!locks.release("never-acquired", "A").await.unwrap());
    }

    #[tokio::test]
    async fn test_owner_token_reads_holder() {
        let (_, locks) = manager();

        locks
            .acquire("res", "holder-1", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            locks.owner_token("res").await.unwrap(),
            Some("holder-1".to_string())
        );
        assert_eq!(locks.owner_token("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_frees_lock() {
        let (_, locks) = manager();

        assert!(locks
            .acquire("short", "A", Duration::from_millis(40))
            .await
            .unwrap());
        assert!(locks.is_locked("short").await.unwrap());

        sleep(Duration::from_millis(80)).await;

        assert!(!locks.is_locked("short").await.unwrap());
        assert!(locks
            .acquire("short", "B", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_extend_is_ownership_gated() {
        let (store, locks) = manager();

        locks
            .acquire("res", "A", Duration::from_millis(60))
            .await
            .unwrap();

        assert!(!locks
            .extend("res", "B", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(locks
            .extend("res", "A", Duration::from_millis(200))
            .await
            .unwrap());

        // Still held after the original TTL would have expired.
        sleep(Duration::from_millis(100)).await;
        assert!(locks.is_locked("res").await.unwrap());
        assert!(store.ttl_of("res").is_some());

        // Gone once the extended TTL elapses.
        sleep(Duration::from_millis(150)).await;
        assert!(!locks.is_locked("res").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_a_caller_error() {
        let (_, locks) = manager();

        assert!(matches!(
            locks.acquire("res", "A", Duration::ZERO).await,
            Err(LockError::InvalidTtl)
        ));
        assert!(matches!(
            locks.extend("res", "A", Duration::ZERO).await,
            Err(LockError::InvalidTtl)
        ));
        assert!(matches!(
            locks
                .wait_for(
                    "res",
                    "A",
                    Duration::ZERO,
                    Duration::from_millis(10),
                    Duration::from_millis(50)
                )
                .await,
            Err(LockError::InvalidTtl)
        ));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_concurrency() {
        let (_, locks) = manager();

        let mut handles = Vec::new();
        for i in 0..10 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .acquire("contended", &format!("token-{}", i), Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(locks.is_locked("contended").await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_times_out_within_one_poll_interval() {
        let (_, locks) = manager();

        locks
            .acquire("held", "owner", Duration::from_secs(30))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let acquired = locks
            .wait_for(
                "held",
                "waiter",
                Duration::from_secs(5),
                Duration::from_millis(25),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(!acquired);
        assert!(elapsed >= Duration::from_millis(100));
        // One poll interval of overshoot plus scheduling slack.
        assert!(elapsed < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_wait_for_acquires_after_release() {
        let (_, locks) = manager();

        locks
            .acquire("handoff", "owner", Duration::from_secs(30))
            .await
            .unwrap();

        let releaser = {
            let locks = locks.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(60)).await;
                assert!(locks.release("handoff", "owner").await.unwrap());
            })
        };

        let acquired = locks
            .wait_for(
                "handoff",
                "waiter",
                Duration::from_secs(5),
                Duration::from_millis(20),
                Duration::from_millis(500),
            )
            .await
            .unwrap();

        releaser.await.unwrap();
        assert!(acquired);
        assert_eq!(
            locks.owner_token("handoff").await.unwrap(),
            Some("waiter".to_string())
        );
    }

    #[test]
    fn test_timestamp_token_is_millisecond_text() {
        let token = timestamp_token();
        let millis: i64 = token.parse().expect("token must be integer text");
        assert!(millis > 0);
    }
}
