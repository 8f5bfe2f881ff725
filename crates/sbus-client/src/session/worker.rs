//! Session acquisition worker.
//!
//! Each worker turns one free session permit plus one free accept permit
//! into one pumping session, over and over, until the manager is cancelled.
//! Accept failures that mean "nothing to claim right now" are absorbed by a
//! fixed backoff; anything else goes to the user error handler.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use sbus_core::{Error, MessagingError};

use crate::link::{AcceptSessionOptions, SessionAcceptor, SessionLink};

use super::handle::SessionHandle;
use super::pool::{Permit, SessionPermits};
use super::registry::SessionRegistry;
use super::types::{SessionErrorHandler, SessionHandlerOptions, SessionMessageHandler};

/// State shared by every worker of one `manage()` call.
pub(crate) struct WorkerContext {
    pub entity: String,
    pub acceptor: Arc<dyn SessionAcceptor>,
    pub permits: Arc<SessionPermits>,
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<dyn SessionMessageHandler>,
    pub on_error: Arc<dyn SessionErrorHandler>,
    pub options: SessionHandlerOptions,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

pub(crate) struct AcquisitionWorker {
    index: usize,
    ctx: Arc<WorkerContext>,
}

impl AcquisitionWorker {
    pub(crate) const fn new(index: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { index, ctx }
    }

    pub(crate) async fn run(self) {
        debug!(entity = %self.ctx.entity, worker = self.index, "Acquisition worker started");
        while !self.ctx.cancel.is_cancelled() {
            if self.iteration().await.is_break() {
                break;
            }
        }
        debug!(entity = %self.ctx.entity, worker = self.index, "Acquisition worker stopped");
    }

    async fn iteration(&self) -> ControlFlow<()> {
        let ctx = &self.ctx;
        let Ok(slot) = ctx.permits.sessions.acquire().await else {
            return ControlFlow::Break(());
        };
        debug!(entity = %ctx.entity, worker = self.index, "Acquired session permit");

        let Ok(_accept) = ctx.permits.accepts.acquire().await else {
            return ControlFlow::Break(());
        };
        debug!(entity = %ctx.entity, worker = self.index, "Acquired accept permit");

        let options = AcceptSessionOptions {
            receive_mode: ctx.options.receive_mode,
            session_id: None,
        };
        match ctx.acceptor.accept_next_session(&options).await {
            Ok(link) => self.start_session(link, slot).await,
            Err(err) => {
                slot.release();
                self.handle_accept_error(err).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_accept_error(&self, err: MessagingError) {
        let ctx = &self.ctx;
        let class = err.classify();
        if class.backs_off() {
            let backoff = ctx.options.no_active_session_backoff;
            info!(
                entity = %ctx.entity,
                worker = self.index,
                backoff_secs = backoff.as_secs_f64(),
                reason = %err.condition,
                "No active session to accept, backing off"
            );
            tokio::select! {
                () = ctx.cancel.cancelled() => {}
                () = tokio::time::sleep(backoff) => {}
            }
        } else {
            error!(
                entity = %ctx.entity,
                worker = self.index,
                error = %err,
                "Failed to accept a session"
            );
            ctx.on_error.handle_error(&Error::Messaging(err));
        }
    }

    async fn start_session(&self, link: Arc<dyn SessionLink>, slot: Permit) {
        let ctx = &self.ctx;
        let handle = Arc::new(SessionHandle::new(
            link,
            ctx.options.receive_mode,
            ctx.cancel.child_token(),
        ));

        if ctx.cancel.is_cancelled() {
            info!(
                entity = %ctx.entity,
                session_id = %handle.session_id(),
                "Session accepted after close, releasing it"
            );
            close_quietly(&ctx.entity, &handle).await;
            return;
        }

        ctx.registry.insert(Arc::clone(&handle)).await;
        info!(
            entity = %ctx.entity,
            worker = self.index,
            session_id = %handle.session_id(),
            "Accepted session"
        );

        let pump_ctx = Arc::clone(ctx);
        ctx.tracker.spawn(async move {
            let outcome = Arc::clone(&handle)
                .run_pump(Arc::clone(&pump_ctx.handler), &pump_ctx.options)
                .await;
            end_session(&pump_ctx, &handle, outcome, slot).await;
        });
    }
}

/// Escalation path for a finished pump: deregister and close the session,
/// vacate its session permit, then report the error unless it is the
/// session simply running dry.
async fn end_session(
    ctx: &WorkerContext,
    handle: &Arc<SessionHandle>,
    outcome: sbus_core::Result<()>,
    slot: Permit,
) {
    ctx.registry.remove(handle).await;
    if handle.is_open() {
        close_quietly(&ctx.entity, handle).await;
    }
    slot.release();

    match outcome {
        Ok(()) => debug!(
            entity = %ctx.entity,
            session_id = %handle.session_id(),
            "Session pump stopped"
        ),
        Err(err) if err.classify().is_reported() => {
            error!(
                entity = %ctx.entity,
                session_id = %handle.session_id(),
                error = %err,
                "Session ended with an error"
            );
            ctx.on_error.handle_error(&err);
        }
        Err(err) => debug!(
            entity = %ctx.entity,
            session_id = %handle.session_id(),
            reason = %err,
            "Session has no more messages"
        ),
    }
}

async fn close_quietly(entity: &str, handle: &SessionHandle) {
    if let Err(e) = handle.close().await {
        error!(
            entity,
            session_id = %handle.session_id(),
            error = %e,
            "Failed to close session"
        );
    }
}
