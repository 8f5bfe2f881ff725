//! Session runtime types.

use std::time::Duration;

use async_trait::async_trait;

use sbus_core::{BoxError, Error, ReceiveMode, SessionConfig};

use crate::message::ReceivedMessage;

use super::handle::SessionHandle;

/// Options for managing sessions and pumping each of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandlerOptions {
    /// Overrides the manager's session limit for this `manage()` call.
    pub max_concurrent_sessions: Option<usize>,
    /// Overrides the manager's accept limit for this `manage()` call.
    pub max_concurrent_accept_requests: Option<usize>,
    /// Complete messages the handler returned `Ok` for but left unsettled.
    pub auto_complete: bool,
    /// Handler invocations in flight per session.
    pub max_concurrent_calls: usize,
    /// Total time the session lock is kept alive; zero disables renewal.
    pub max_auto_renew_duration: Duration,
    /// How long a session may stay empty before its pump ends.
    pub max_message_wait: Duration,
    /// Sleep after an accept finds no claimable session.
    pub no_active_session_backoff: Duration,
    pub receive_mode: ReceiveMode,
}

impl Default for SessionHandlerOptions {
    /// Config defaults, leaving the manager's own limits in effect.
    fn default() -> Self {
        Self {
            max_concurrent_sessions: None,
            max_concurrent_accept_requests: None,
            ..Self::from(&SessionConfig::default())
        }
    }
}

impl From<&SessionConfig> for SessionHandlerOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_concurrent_sessions: Some(config.max_concurrent_sessions),
            max_concurrent_accept_requests: config.max_concurrent_accept_requests,
            auto_complete: config.auto_complete,
            max_concurrent_calls: config.max_concurrent_calls_per_session.max(1),
            max_auto_renew_duration: Duration::from_secs(config.max_auto_renew_duration_secs),
            max_message_wait: Duration::from_secs(config.max_message_wait_secs),
            no_active_session_backoff: Duration::from_secs(config.no_active_session_backoff_secs),
            receive_mode: config.receive_mode,
        }
    }
}

/// User callback invoked for every message of every managed session.
#[async_trait]
pub trait SessionMessageHandler: Send + Sync {
    /// Process one message. Returning `Err` abandons the message (in
    /// peek-lock mode) and ends the session.
    async fn handle(
        &self,
        session: &SessionHandle,
        message: &ReceivedMessage,
    ) -> Result<(), BoxError>;
}

/// User callback for failures that are not part of normal operation.
pub trait SessionErrorHandler: Send + Sync {
    fn handle_error(&self, error: &Error);
}

impl<F> SessionErrorHandler for F
where
    F: Fn(&Error) + Send + Sync,
{
    fn handle_error(&self, error: &Error) {
        self(error);
    }
}

/// Lifecycle of a session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Managing,
    /// Terminal; a fresh manager is required to manage again.
    Closed,
}

/// Point-in-time counters for a session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub state: ManagerState,
    /// Sessions currently registered (accepted and pumping).
    pub active_sessions: usize,
    pub session_capacity: usize,
    pub available_session_permits: usize,
    pub accept_capacity: usize,
    pub available_accept_permits: usize,
}

/// Session manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Session manager is already managing sessions")]
    AlreadyManaging,

    #[error("Session manager has been closed")]
    Closed,
}
