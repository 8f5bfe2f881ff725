//! Session manager.
//!
//! [`SessionManager`] is the supervisor for receiving from a session-enabled
//! entity. `manage()` builds a fresh pair of permit pools and spawns one
//! [`AcquisitionWorker`] per allowed in-flight accept; `close()` signals
//! every worker and pump to stop. Per-session failures never surface from
//! these calls; they go to the user error handler or are absorbed.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::link::SessionAcceptor;

use super::handle::SessionHandle;
use super::pool::SessionPermits;
use super::registry::SessionRegistry;
use super::types::{
    ManagerError, ManagerState, ManagerStats, SessionErrorHandler, SessionHandlerOptions,
    SessionMessageHandler,
};
use super::worker::{AcquisitionWorker, WorkerContext};

/// Default session limit, matching the broker client's default.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 2000;

/// Number of CPUs the host reports, or 1 if unknown.
pub fn host_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Supervises concurrent acceptance and pumping of sessions for one entity.
pub struct SessionManager {
    entity: String,
    acceptor: Arc<dyn SessionAcceptor>,
    max_concurrent_sessions: AtomicUsize,
    max_concurrent_accept_requests: AtomicUsize,
    /// Caps the accept limit; normally the host CPU count.
    concurrency_hint: usize,
    state: Mutex<ManagerState>,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
    /// Pools of the current `manage()` call.
    permits: Mutex<Option<Arc<SessionPermits>>>,
    /// Workers and pumps, for draining after close.
    tracker: TaskTracker,
}

impl SessionManager {
    /// Create a manager for `entity` whose accept limit is capped by the
    /// host CPU count.
    pub fn new(entity: impl Into<String>, acceptor: Arc<dyn SessionAcceptor>) -> Self {
        Self::with_concurrency_hint(entity, acceptor, host_concurrency())
    }

    /// Create a manager with an explicit cap for the accept limit.
    pub fn with_concurrency_hint(
        entity: impl Into<String>,
        acceptor: Arc<dyn SessionAcceptor>,
        concurrency_hint: usize,
    ) -> Self {
        let concurrency_hint = concurrency_hint.max(1);
        Self {
            entity: entity.into(),
            acceptor,
            max_concurrent_sessions: AtomicUsize::new(DEFAULT_MAX_CONCURRENT_SESSIONS),
            max_concurrent_accept_requests: AtomicUsize::new(
                DEFAULT_MAX_CONCURRENT_SESSIONS.min(concurrency_hint),
            ),
            concurrency_hint,
            state: Mutex::new(ManagerState::Idle),
            cancel: CancellationToken::new(),
            registry: Arc::new(SessionRegistry::new()),
            permits: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Set the session limit. Also resets the accept limit to
    /// `min(n, concurrency hint)`; override it afterwards if needed.
    /// Takes effect at the next `manage()`.
    ///
    /// Values above [`Semaphore::MAX_PERMITS`] are clamped to it.
    pub fn set_max_concurrent_sessions(&self, n: usize) -> Result<(), ManagerError> {
        let n = checked_limit("max_concurrent_sessions", n)?;
        self.max_concurrent_sessions.store(n, Ordering::Relaxed);
        self.set_max_concurrent_accept_requests(n)
    }

    /// Set the accept limit, capped by the concurrency hint.
    /// Takes effect at the next `manage()`.
    pub fn set_max_concurrent_accept_requests(&self, n: usize) -> Result<(), ManagerError> {
        let n = checked_limit("max_concurrent_accept_requests", n)?;
        self.max_concurrent_accept_requests
            .store(n.min(self.concurrency_hint), Ordering::Relaxed);
        Ok(())
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    pub fn max_concurrent_accept_requests(&self) -> usize {
        self.max_concurrent_accept_requests.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    pub fn is_managing(&self) -> bool {
        self.state() == ManagerState::Managing
    }

    /// Start accepting and pumping sessions.
    ///
    /// Returns once the workers are spawned; must be called from within a
    /// Tokio runtime. Fails with [`ManagerError::AlreadyManaging`] while a
    /// previous call is active and with [`ManagerError::Closed`] after
    /// [`close`](Self::close).
    pub fn manage(
        &self,
        handler: Arc<dyn SessionMessageHandler>,
        on_error: Arc<dyn SessionErrorHandler>,
        options: SessionHandlerOptions,
    ) -> Result<(), ManagerError> {
        let mut state = self.lock_state();
        match *state {
            ManagerState::Managing => return Err(ManagerError::AlreadyManaging),
            ManagerState::Closed => return Err(ManagerError::Closed),
            ManagerState::Idle => {}
        }
        // Both overrides are checked before either is stored.
        let sessions = options
            .max_concurrent_sessions
            .map(|n| checked_limit("max_concurrent_sessions", n))
            .transpose()?;
        let accepts = options
            .max_concurrent_accept_requests
            .map(|n| checked_limit("max_concurrent_accept_requests", n))
            .transpose()?;
        if let Some(n) = sessions {
            self.set_max_concurrent_sessions(n)?;
        }
        if let Some(n) = accepts {
            self.set_max_concurrent_accept_requests(n)?;
        }
        *state = ManagerState::Managing;
        drop(state);

        let max_sessions = self.max_concurrent_sessions();
        let max_accepts = self.max_concurrent_accept_requests();
        let permits = Arc::new(SessionPermits::new(max_sessions, max_accepts));
        *self.lock_permits() = Some(Arc::clone(&permits));

        info!(
            entity = %self.entity,
            max_concurrent_sessions = max_sessions,
            max_concurrent_accept_requests = max_accepts,
            "Managing sessions"
        );

        let ctx = Arc::new(WorkerContext {
            entity: self.entity.clone(),
            acceptor: Arc::clone(&self.acceptor),
            permits,
            registry: Arc::clone(&self.registry),
            handler,
            on_error,
            options,
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
        });
        for index in 0..max_accepts {
            let worker = AcquisitionWorker::new(index, Arc::clone(&ctx));
            self.tracker.spawn(worker.run());
        }
        Ok(())
    }

    /// Signal every worker and pump to stop. Does not wait; see
    /// [`wait_until_drained`](Self::wait_until_drained).
    ///
    /// Workers parked on a permit or in a backoff stop immediately. An
    /// accept call already in flight is awaited, and a session it yields is
    /// closed rather than pumped. Pumps stop taking messages and close their
    /// sessions once in-flight handler calls return.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == ManagerState::Closed {
                return;
            }
            *state = ManagerState::Closed;
        }
        self.cancel.cancel();
        if let Some(permits) = self.lock_permits().as_ref() {
            permits.close();
        }
        self.tracker.close();
        info!(entity = %self.entity, "Session manager closed");
    }

    /// Wait until [`close`](Self::close) has been called and every worker
    /// and pump has finished.
    pub async fn wait_until_drained(&self) {
        self.cancel.cancelled().await;
        self.tracker.wait().await;
    }

    /// Handle for a session currently being pumped.
    pub async fn session(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.registry.get(session_id).await
    }

    /// IDs of the sessions currently being pumped.
    pub async fn active_session_ids(&self) -> Vec<String> {
        self.registry.ids().await
    }

    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn stats(&self) -> ManagerStats {
        let permits = self.lock_permits().clone();
        let (session_capacity, available_session_permits, accept_capacity, available_accept) =
            permits.map_or((0, 0, 0, 0), |p| {
                (
                    p.sessions.capacity(),
                    p.sessions.available_permits(),
                    p.accepts.capacity(),
                    p.accepts.available_permits(),
                )
            });
        ManagerStats {
            state: self.state(),
            active_sessions: self.registry.len().await,
            session_capacity,
            available_session_permits,
            accept_capacity,
            available_accept_permits: available_accept,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_permits(&self) -> MutexGuard<'_, Option<Arc<SessionPermits>>> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reject a zero limit; clamp one the semaphore cannot hold.
fn checked_limit(name: &str, n: usize) -> Result<usize, ManagerError> {
    if n == 0 {
        return Err(ManagerError::InvalidArgument {
            message: format!("{name} must be greater than 0"),
        });
    }
    Ok(n.min(Semaphore::MAX_PERMITS))
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening
)]
#[path = "manager_tests.rs"]
mod tests;
