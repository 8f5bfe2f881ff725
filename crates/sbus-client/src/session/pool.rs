//! Semaphore-based permit pools bounding session concurrency.
//!
//! A [`PermitPool`] issues permits from a Tokio semaphore (FIFO-fair, so a
//! worker parked first is woken first). Permits are RAII guards: dropping a
//! [`Permit`] returns it exactly once, so a release without a matching
//! acquire cannot be expressed. [`SessionPermits`] pairs the two pools a
//! `manage()` call needs.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// A permit from a [`PermitPool`]; returned to the pool when dropped.
#[derive(Debug)]
pub struct Permit {
    pool: &'static str,
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    /// Return the permit now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        debug!(pool = self.pool, "Releasing permit");
    }
}

/// Counting semaphore with a fixed capacity.
#[derive(Debug)]
pub struct PermitPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl PermitPool {
    /// Create a pool holding `capacity` permits, at most
    /// [`Semaphore::MAX_PERMITS`].
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        debug!(pool = name, capacity, "PermitPool created");
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Acquire a permit, waiting until one becomes available.
    ///
    /// Fails once the pool is closed, including for callers already waiting.
    pub async fn acquire(&self) -> Result<Permit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed { pool: self.name })?;
        debug!(pool = self.name, "Acquired permit");
        Ok(Permit {
            pool: self.name,
            _permit: permit,
        })
    }

    /// Acquire a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(Permit {
            pool: self.name,
            _permit: permit,
        })
    }

    /// Number of permits not currently held.
    pub fn available_permits(&self) -> usize {
        let available = self.semaphore.available_permits();
        if available > self.capacity {
            warn!(
                pool = self.name,
                available,
                capacity = self.capacity,
                "Permit pool holds more permits than its capacity"
            );
        }
        available.min(self.capacity)
    }

    /// Number of permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available_permits()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Close the pool: pending and future `acquire` calls fail. Permits
    /// already held stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// The two pools created for each `manage()` call.
#[derive(Debug)]
pub struct SessionPermits {
    /// Bounds sessions being serviced at once.
    pub sessions: PermitPool,
    /// Bounds accept calls in flight at once.
    pub accepts: PermitPool,
}

impl SessionPermits {
    pub fn new(max_concurrent_sessions: usize, max_concurrent_accept_requests: usize) -> Self {
        Self {
            sessions: PermitPool::new("sessions", max_concurrent_sessions),
            accepts: PermitPool::new("accepts", max_concurrent_accept_requests),
        }
    }

    pub fn close(&self) {
        self.sessions.close();
        self.accepts.close();
    }
}

/// Errors from a permit pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The semaphore was closed (manager shut down).
    #[error("Permit pool '{pool}' has been closed")]
    Closed { pool: &'static str },
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn pool_starts_full() {
        let pool = PermitPool::new("test", 3);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available_permits(), 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn oversized_capacity_is_clamped() {
        let pool = PermitPool::new("test", usize::MAX);
        assert_eq!(pool.capacity(), Semaphore::MAX_PERMITS);
        let permit = pool.try_acquire();
        assert!(permit.is_some());
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    #[allow(clippy::significant_drop_tightening)]
    async fn try_acquire_stops_at_capacity() {
        let pool = PermitPool::new("test", 2);
        let permit1 = pool.try_acquire();
        assert!(permit1.is_some());
        assert_eq!(pool.available_permits(), 1);

        let permit2 = pool.try_acquire();
        assert!(permit2.is_some());
        assert_eq!(pool.available_permits(), 0);

        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_use(), 2);
        drop((permit1, permit2));
    }

    #[tokio::test]
    async fn permit_returned_on_drop() {
        let pool = PermitPool::new("test", 1);
        {
            let _permit = pool.try_acquire().unwrap();
            assert_eq!(pool.available_permits(), 0);
        }
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn explicit_release_returns_once() {
        let pool = PermitPool::new("test", 2);
        let permit = pool.acquire().await.unwrap();
        permit.release();
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn available_never_leaves_bounds() {
        let pool = PermitPool::new("test", 3);
        let mut held = Vec::new();
        for step in 0..20 {
            if step % 3 == 2 {
                held.pop();
            } else if let Some(p) = pool.try_acquire() {
                held.push(p);
            }
            let available = pool.available_permits();
            assert!(available <= pool.capacity());
            assert_eq!(available + held.len(), pool.capacity());
        }
    }

    #[tokio::test]
    async fn acquire_waits_for_permit() {
        let pool = Arc::new(PermitPool::new("test", 1));
        let permit = pool.try_acquire().unwrap();

        let pool_clone = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            pool_clone.acquire().await.unwrap();
        });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        drop(permit);

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("acquire should complete after permit released")
            .unwrap();
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_error() {
        let pool = Arc::new(PermitPool::new("test", 1));
        let held = pool.try_acquire().unwrap();

        let pool_clone = Arc::clone(&pool);
        let handle = tokio::spawn(async move { pool_clone.acquire().await });
        tokio::task::yield_now().await;

        pool.close();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PoolError::Closed { pool: "test" })));
        assert!(pool.is_closed());

        drop(held);
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn session_permits_are_independent() {
        let permits = SessionPermits::new(4, 2);
        let _slot = permits.sessions.try_acquire().unwrap();
        assert_eq!(permits.sessions.available_permits(), 3);
        assert_eq!(permits.accepts.available_permits(), 2);
    }
}
