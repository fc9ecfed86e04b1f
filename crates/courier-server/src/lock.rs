//! Named, TTL-bounded mutual exclusion over the shared lease table.
//!
//! [`LeaseLocker::acquire`] returns a [`LeaseGuard`] that releases its lease
//! when dropped, so every exit from a critical section releases it. A holder
//! that crashes keeps the name only until the lease expires.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_shared::types::{now_millis, ThreadId};

use crate::error::ServerError;
use crate::store::Store;

/// Lease name serializing mutations of one thread.
pub fn thread_lock(thread_id: &ThreadId) -> String {
    format!("signal_threads_{thread_id}")
}

/// Lease name serializing mutations of one user's address book.
pub fn user_contact_lock(phone_full: &str) -> String {
    format!("user_contacts_{phone_full}")
}

/// Lease name serializing mutations of one phone's reverse contact index.
pub fn phone_in_user_contact_lock(phone_full: &str) -> String {
    format!("phone_in_user_contacts_{phone_full}")
}

#[derive(Clone)]
pub struct LeaseLocker {
    store: Store,
    ttl: Duration,
    retry_delay: Duration,
    max_attempts: u32,
}

impl LeaseLocker {
    pub fn new(store: Store, ttl: Duration, retry_delay: Duration, max_attempts: u32) -> Self {
        Self {
            store,
            ttl,
            retry_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Acquire the lease `name`, retrying while another holder owns it.
    ///
    /// Returns `Canceled` if `deadline` passes first and `Internal` once the
    /// attempts are exhausted.
    pub async fn acquire(&self, name: &str, deadline: Instant) -> Result<LeaseGuard, ServerError> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = self.ttl.as_millis() as i64;

        for attempt in 1..=self.max_attempts {
            if Instant::now() >= deadline {
                return Err(ServerError::Canceled(format!(
                    "deadline exceeded while acquiring lock {name}"
                )));
            }

            let acquired = self
                .store
                .call(|db| db.try_acquire_lease(name, &token, ttl_ms, now_millis()))?;
            if acquired {
                debug!(lock = name, attempt, "Lease acquired");
                return Ok(LeaseGuard {
                    store: self.store.clone(),
                    name: name.to_string(),
                    token,
                });
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(ServerError::Canceled(format!(
                            "deadline exceeded while acquiring lock {name}"
                        )));
                    }
                }
            }
        }

        warn!(lock = name, attempts = self.max_attempts, "Lease acquisition failed");
        Err(ServerError::Internal(format!("failed to acquire lock {name}")))
    }

    /// Run `f` while holding the lease `name`.
    pub async fn with_lock<T>(
        &self,
        name: &str,
        deadline: Instant,
        f: impl FnOnce() -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let _guard = self.acquire(name, deadline).await?;
        f()
    }
}

/// A held lease. Dropping it releases the lease.
pub struct LeaseGuard {
    store: Store,
    name: String,
    token: String,
}

impl LeaseGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        match self.store.call(|db| db.release_lease(&self.name, &self.token)) {
            Ok(true) => debug!(lock = %self.name, "Lease released"),
            Ok(false) => warn!(lock = %self.name, "Lease expired before release"),
            Err(e) => warn!(lock = %self.name, error = %e, "Failed to release lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn locker(store: &Store, attempts: u32) -> LeaseLocker {
        LeaseLocker::new(
            store.clone(),
            Duration::from_secs(30),
            Duration::from_millis(5),
            attempts,
        )
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn guard_release_lets_next_holder_in() {
        let (_dir, store) = test_store();
        let locker = locker(&store, 3);

        let guard = locker.acquire("signal_threads_t1", soon()).await.unwrap();
        assert_eq!(guard.name(), "signal_threads_t1");
        drop(guard);

        assert!(locker.acquire("signal_threads_t1", soon()).await.is_ok());
    }

    #[tokio::test]
    async fn contention_exhausts_into_internal() {
        let (_dir, store) = test_store();
        let locker = locker(&store, 3);

        let _held = locker.acquire("n", soon()).await.unwrap();
        let err = locker.acquire("n", soon()).await.err().unwrap();
        assert!(matches!(err, ServerError::Internal(_)));
    }

    #[tokio::test]
    async fn passed_deadline_is_canceled() {
        let (_dir, store) = test_store();
        let locker = locker(&store, 1_000);

        let _held = locker.acquire("n", soon()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        let err = locker.acquire("n", deadline).await.err().unwrap();
        assert!(matches!(err, ServerError::Canceled(_)));
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let (_dir, store) = test_store();
        let locker = locker(&store, 2);

        let result: Result<(), ServerError> = locker
            .with_lock("n", soon(), || {
                Err(ServerError::PermissionDenied("not an admin".into()))
            })
            .await;
        assert!(matches!(result, Err(ServerError::PermissionDenied(_))));

        assert!(locker.acquire("n", soon()).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let (_dir, store) = test_store();
        let short = LeaseLocker::new(store.clone(), Duration::from_millis(20), Duration::from_millis(10), 10);

        let stale = short.acquire("n", soon()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(short.acquire("n", soon()).await.is_ok());
        drop(stale);
    }
}
