//! Seams to the protocol layer.
//!
//! The session runtime never speaks AMQP itself. It asks a
//! [`SessionAcceptor`] for the next lockable session and then drives the
//! returned [`SessionLink`]. Transport-level retries live below these traits;
//! failures arrive already mapped to a [`MessagingError`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use uuid::Uuid;

use sbus_core::{MessagingError, ReceiveMode};

use crate::message::{Disposition, ReceivedMessage};

/// Parameters for one accept call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptSessionOptions {
    pub receive_mode: ReceiveMode,
    /// Lock this specific session instead of the next available one.
    pub session_id: Option<String>,
}

/// Claims sessions from a session-enabled entity.
#[async_trait]
pub trait SessionAcceptor: Send + Sync {
    /// Lock the next available session.
    ///
    /// Fails with `com.microsoft:timeout` when no unlocked session appeared
    /// in time, or `com.microsoft:session-cannot-be-locked` when another
    /// receiver holds the requested session.
    async fn accept_next_session(
        &self,
        options: &AcceptSessionOptions,
    ) -> Result<Arc<dyn SessionLink>, MessagingError>;
}

/// A receive link bound to one locked session.
#[async_trait]
pub trait SessionLink: Send + Sync {
    fn session_id(&self) -> &str;

    /// Current session lock expiry as last reported by the broker.
    fn locked_until(&self) -> SystemTime;

    /// Wait up to `max_wait` for the next message. Fails with
    /// `com.microsoft:message-wait-timeout` when the session stays empty.
    async fn receive(&self, max_wait: Duration) -> Result<ReceivedMessage, MessagingError>;

    async fn settle(&self, lock_token: Uuid, disposition: Disposition)
    -> Result<(), MessagingError>;

    /// Extend the session lock; returns the new expiry.
    async fn renew_lock(&self) -> Result<SystemTime, MessagingError>;

    async fn get_state(&self) -> Result<Option<Vec<u8>>, MessagingError>;

    async fn set_state(&self, state: Option<Vec<u8>>) -> Result<(), MessagingError>;

    /// Release the session lock and detach the link.
    async fn close(&self) -> Result<(), MessagingError>;
}
