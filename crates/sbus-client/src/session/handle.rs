//! One locked session and its message pump.
//!
//! A [`SessionHandle`] owns the [`SessionLink`] for a session it holds the
//! lock on. [`SessionHandle::run_pump`] delivers that session's messages to
//! a [`SessionMessageHandler`] until the session runs dry, fails, is closed,
//! or the owning manager is cancelled. While the pump runs in peek-lock mode
//! the session lock is renewed in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sbus_core::{Error, ReceiveMode, Result};

use crate::link::SessionLink;
use crate::message::{DeadLetterOptions, Disposition, ReceivedMessage, UserProperties};

use super::types::{SessionHandlerOptions, SessionMessageHandler};

/// Renew this long before the session lock expires.
const LOCK_RENEW_MARGIN: Duration = Duration::from_secs(10);

/// An exclusively locked session.
pub struct SessionHandle {
    link: Arc<dyn SessionLink>,
    session_id: String,
    receive_mode: ReceiveMode,
    open: AtomicBool,
    locked_until: Mutex<SystemTime>,
    /// Cancelled on close; a child of the manager's token when managed.
    cancel: CancellationToken,
    /// Set when background lock renewal fails, ending the pump.
    lock_error: Mutex<Option<Error>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("receive_mode", &self.receive_mode)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(
        link: Arc<dyn SessionLink>,
        receive_mode: ReceiveMode,
        cancel: CancellationToken,
    ) -> Self {
        let session_id = link.session_id().to_string();
        let locked_until = link.locked_until();
        Self {
            link,
            session_id,
            receive_mode,
            open: AtomicBool::new(true),
            locked_until: Mutex::new(locked_until),
            cancel,
            lock_error: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub const fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Session lock expiry as of the last accept or renewal.
    pub fn locked_until(&self) -> SystemTime {
        *self.locked_until.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "session '{}' is closed",
                self.session_id
            )))
        }
    }

    /// Receive one message outside of a pump.
    pub async fn receive(&self, max_wait: Duration) -> Result<ReceivedMessage> {
        self.ensure_open()?;
        Ok(self.link.receive(max_wait).await?)
    }

    /// Extend the session lock.
    pub async fn renew_lock(&self) -> Result<SystemTime> {
        self.ensure_open()?;
        let until = self.link.renew_lock().await?;
        *self.locked_until.lock().unwrap_or_else(PoisonError::into_inner) = until;
        debug!(session_id = %self.session_id, "Renewed session lock");
        Ok(until)
    }

    pub async fn get_state(&self) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.link.get_state().await?)
    }

    pub async fn set_state(&self, state: Option<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        Ok(self.link.set_state(state).await?)
    }

    pub async fn complete(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message, Disposition::Complete).await
    }

    pub async fn abandon(
        &self,
        message: &ReceivedMessage,
        properties_to_modify: UserProperties,
    ) -> Result<()> {
        self.settle(
            message,
            Disposition::Abandon {
                properties_to_modify,
            },
        )
        .await
    }

    pub async fn defer(
        &self,
        message: &ReceivedMessage,
        properties_to_modify: UserProperties,
    ) -> Result<()> {
        self.settle(
            message,
            Disposition::Defer {
                properties_to_modify,
            },
        )
        .await
    }

    pub async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        options: DeadLetterOptions,
    ) -> Result<()> {
        self.settle(message, Disposition::DeadLetter(options)).await
    }

    /// Settle a message received from this session.
    pub async fn settle(&self, message: &ReceivedMessage, disposition: Disposition) -> Result<()> {
        if self.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(Error::InvalidArgument(format!(
                "cannot {} message '{}': receive-and-delete messages are already settled",
                disposition.name(),
                message.message_id
            )));
        }
        if message.session_id != self.session_id {
            return Err(Error::InvalidArgument(format!(
                "message '{}' belongs to session '{}', not '{}'",
                message.message_id, message.session_id, self.session_id
            )));
        }
        let lock_token = message.lock_token.ok_or_else(|| {
            Error::InvalidArgument(format!("message '{}' has no lock token", message.message_id))
        })?;
        self.ensure_open()?;
        if !message.try_mark_settled() {
            return Err(Error::InvalidArgument(format!(
                "message '{}' is already settled",
                message.message_id
            )));
        }
        let name = disposition.name();
        if let Err(e) = self.link.settle(lock_token, disposition).await {
            message.unmark_settled();
            return Err(e.into());
        }
        debug!(
            session_id = %self.session_id,
            message_id = %message.message_id,
            disposition = name,
            "Settled message"
        );
        Ok(())
    }

    /// Close the session and release its lock. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        self.link.close().await?;
        info!(session_id = %self.session_id, "Closed session");
        Ok(())
    }

    /// Deliver messages to `handler` until the session ends.
    ///
    /// Returns `Ok(())` when stopped by close or cancellation. Otherwise
    /// returns the error that ended the session: a `MessageWaitTimeout` when
    /// it ran dry, a `Handler` error after the failed message was abandoned,
    /// or a broker error from receive, settlement, or lock renewal. Handler
    /// calls already in flight are awaited before returning.
    pub async fn run_pump(
        self: Arc<Self>,
        handler: Arc<dyn SessionMessageHandler>,
        options: &SessionHandlerOptions,
    ) -> Result<()> {
        let pump_cancel = self.cancel.child_token();
        let renewal = self.spawn_lock_renewal(options.max_auto_renew_duration, &pump_cancel);
        let calls = Arc::new(Semaphore::new(
            options.max_concurrent_calls.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let auto_complete = options.auto_complete;
        let mut in_flight: JoinSet<Result<()>> = JoinSet::new();

        debug!(
            session_id = %self.session_id,
            max_concurrent_calls = options.max_concurrent_calls,
            "Starting message pump"
        );

        let mut outcome = loop {
            if let Some(err) = take_failed_call(&self.session_id, &mut in_flight) {
                break Err(err);
            }
            let permit = tokio::select! {
                () = pump_cancel.cancelled() => break self.stopped(),
                permit = Arc::clone(&calls).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };
            if let Some(err) = take_failed_call(&self.session_id, &mut in_flight) {
                break Err(err);
            }
            let received = tokio::select! {
                () = pump_cancel.cancelled() => break self.stopped(),
                received = self.link.receive(options.max_message_wait) => received,
            };
            match received {
                Ok(message) => {
                    let session = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        session
                            .dispatch(handler.as_ref(), message, auto_complete)
                            .await
                    });
                }
                Err(err) => break Err(err.into()),
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = flatten_call(&self.session_id, joined)
                && outcome.is_ok()
            {
                outcome = Err(err);
            }
        }
        pump_cancel.cancel();
        if let Some(renewal) = renewal {
            renewal.abort();
        }
        debug!(session_id = %self.session_id, "Message pump stopped");
        outcome
    }

    /// Outcome of a pump whose cancellation token fired.
    fn stopped(&self) -> Result<()> {
        let lock_error = self
            .lock_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        lock_error.map_or(Ok(()), Err)
    }

    async fn dispatch(
        &self,
        handler: &dyn SessionMessageHandler,
        message: ReceivedMessage,
        auto_complete: bool,
    ) -> Result<()> {
        let peek_lock = self.receive_mode == ReceiveMode::PeekLock;
        match handler.handle(self, &message).await {
            Ok(()) => {
                if auto_complete && peek_lock && !message.is_settled() {
                    self.complete(&message).await?;
                }
                Ok(())
            }
            Err(source) => {
                warn!(
                    session_id = %self.session_id,
                    message_id = %message.message_id,
                    error = %source,
                    "Message handler failed"
                );
                if peek_lock
                    && !message.is_settled()
                    && let Err(e) = self.abandon(&message, UserProperties::new()).await
                {
                    warn!(
                        session_id = %self.session_id,
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to abandon message after handler error"
                    );
                }
                Err(Error::Handler {
                    session_id: self.session_id.clone(),
                    source,
                })
            }
        }
    }

    /// Keep the session lock alive until `max_duration` has passed or the
    /// pump stops. A failed renewal cancels the pump.
    fn spawn_lock_renewal(
        self: &Arc<Self>,
        max_duration: Duration,
        pump_cancel: &CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if max_duration.is_zero() || self.receive_mode == ReceiveMode::ReceiveAndDelete {
            return None;
        }
        let session = Arc::clone(self);
        let pump_cancel = pump_cancel.clone();
        Some(tokio::spawn(async move {
            // `None` when the window is too large to represent: renew until cancelled.
            let deadline = Instant::now().checked_add(max_duration);
            loop {
                let Some(next) = Instant::now().checked_add(renew_delay(session.locked_until()))
                else {
                    pump_cancel.cancelled().await;
                    return;
                };
                if deadline.is_some_and(|deadline| next >= deadline) {
                    debug!(session_id = %session.session_id, "Lock auto-renew window elapsed");
                    return;
                }
                tokio::select! {
                    () = pump_cancel.cancelled() => return,
                    () = tokio::time::sleep_until(next) => {}
                }
                if let Err(err) = session.renew_lock().await {
                    warn!(
                        session_id = %session.session_id,
                        error = %err,
                        "Failed to renew session lock"
                    );
                    *session
                        .lock_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(err);
                    pump_cancel.cancel();
                    return;
                }
            }
        }))
    }
}

/// Time to wait before renewing a lock that expires at `locked_until`.
fn renew_delay(locked_until: SystemTime) -> Duration {
    let remaining = locked_until
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    if remaining > LOCK_RENEW_MARGIN * 2 {
        remaining - LOCK_RENEW_MARGIN
    } else {
        remaining / 2
    }
}

/// Pop the first finished handler call that failed, if any.
fn take_failed_call(session_id: &str, in_flight: &mut JoinSet<Result<()>>) -> Option<Error> {
    while let Some(joined) = in_flight.try_join_next() {
        if let Err(err) = flatten_call(session_id, joined) {
            return Some(err);
        }
    }
    None
}

/// A panicked or aborted handler call counts as a handler failure.
fn flatten_call(
    session_id: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(join_err) => Err(Error::Handler {
            session_id: session_id.to_string(),
            source: Box::new(join_err),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_delay_keeps_margin_for_long_locks() {
        let until = SystemTime::now() + Duration::from_secs(60);
        let delay = renew_delay(until);
        assert!(delay <= Duration::from_secs(50));
        assert!(delay > Duration::from_secs(45));
    }

    #[test]
    fn renew_delay_halves_short_locks() {
        let until = SystemTime::now() + Duration::from_secs(8);
        assert!(renew_delay(until) <= Duration::from_secs(4));
    }

    #[test]
    fn renew_delay_is_zero_for_expired_locks() {
        let until = SystemTime::now() - Duration::from_secs(1);
        assert_eq!(renew_delay(until), Duration::ZERO);
    }
}
