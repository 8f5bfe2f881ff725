//! Messages received from a session and how they are settled.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Application properties attached to a message.
pub type UserProperties = HashMap<String, serde_json::Value>;

/// A message delivered from a locked session.
///
/// Clones share the settlement flag, so settling through any clone is
/// visible to the pump's auto-complete check.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub session_id: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub label: Option<String>,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub enqueued_at: SystemTime,
    /// Message lock expiry; `None` for receive-and-delete deliveries.
    pub locked_until: Option<SystemTime>,
    /// Token used to settle the message; `None` for receive-and-delete.
    pub lock_token: Option<Uuid>,
    pub user_properties: UserProperties,
    settled: Arc<AtomicBool>,
}

impl ReceivedMessage {
    pub fn new(
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        body: Vec<u8>,
        sequence_number: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            session_id: session_id.into(),
            body,
            content_type: None,
            label: None,
            sequence_number,
            delivery_count: 0,
            enqueued_at: SystemTime::now(),
            locked_until: None,
            lock_token: None,
            user_properties: HashMap::new(),
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a peek-lock token.
    #[must_use]
    pub fn with_lock(mut self, lock_token: Uuid, locked_until: SystemTime) -> Self {
        self.lock_token = Some(lock_token);
        self.locked_until = Some(locked_until);
        self
    }

    /// Mark as already settled by the broker (receive-and-delete delivery).
    #[must_use]
    pub fn pre_settled(self) -> Self {
        self.settled.store(true, Ordering::Release);
        self
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Flip the settled flag. Returns `false` if it was already settled.
    pub(crate) fn try_mark_settled(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo [`Self::try_mark_settled`] after the broker rejected the settlement.
    pub(crate) fn unmark_settled(&self) {
        self.settled.store(false, Ordering::Release);
    }

    /// Decode the body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Reason attached to a dead-lettered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterOptions {
    pub reason: String,
    pub description: String,
}

/// Settlement outcome sent to the broker for a locked message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Remove the message from the session.
    Complete,
    /// Release the lock so the message is redelivered.
    Abandon { properties_to_modify: UserProperties },
    /// Set aside; retrievable later only by sequence number.
    Defer { properties_to_modify: UserProperties },
    /// Move to the entity's dead-letter sub-queue.
    DeadLetter(DeadLetterOptions),
}

impl Disposition {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon { .. } => "abandon",
            Self::Defer { .. } => "defer",
            Self::DeadLetter(_) => "dead-letter",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_settlement() {
        let msg = ReceivedMessage::new("m1", "s1", b"{}".to_vec(), 1);
        let clone = msg.clone();
        assert!(clone.try_mark_settled());
        assert!(msg.is_settled());
        assert!(!msg.try_mark_settled());
    }

    #[test]
    fn pre_settled_messages_cannot_be_settled_again() {
        let msg = ReceivedMessage::new("m1", "s1", Vec::new(), 1).pre_settled();
        assert!(msg.is_settled());
        assert!(!msg.try_mark_settled());
    }

    #[test]
    fn body_json_decodes() {
        let msg = ReceivedMessage::new("m1", "s1", br#"{"qty": 3}"#.to_vec(), 7);
        let value: serde_json::Value = msg.body_json().unwrap();
        assert_eq!(value["qty"], 3);
    }
}
