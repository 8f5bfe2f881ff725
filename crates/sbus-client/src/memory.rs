//! In-memory broker for tests and the soak binary.
//!
//! [`MemoryBroker`] implements [`SessionAcceptor`] over a set of in-process
//! session queues and hands out [`SessionLink`]s that honour session locks,
//! message locks and settlement. Failures can be scripted per call, and
//! probes count accept calls and open sessions so concurrency limits can be
//! asserted from outside.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use sbus_core::{ErrorCondition, MessagingError, ReceiveMode};

use crate::link::{AcceptSessionOptions, SessionAcceptor, SessionLink};
use crate::message::{DeadLetterOptions, Disposition, ReceivedMessage, UserProperties};

const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    sequence_number: i64,
    delivery_count: u32,
    enqueued_at: SystemTime,
    user_properties: UserProperties,
}

#[derive(Debug, Default)]
struct SessionQueue {
    messages: VecDeque<StoredMessage>,
    locked: bool,
    state: Option<Vec<u8>>,
    in_flight: HashMap<Uuid, StoredMessage>,
    deferred: Vec<StoredMessage>,
    receive_failures: VecDeque<MessagingError>,
    renew_failures: VecDeque<MessagingError>,
}

#[derive(Debug, Default)]
struct BrokerState {
    sessions: BTreeMap<String, SessionQueue>,
    accept_failures: VecDeque<MessagingError>,
    next_sequence: i64,
    completed: Vec<String>,
    dead_lettered: Vec<(String, DeadLetterOptions)>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    /// Woken whenever a message arrives or a session is unlocked.
    changed: Notify,
    accept_timeout: Mutex<Duration>,
    lock_duration: Mutex<Duration>,
    accept_calls: AtomicUsize,
    accepts_in_flight: AtomicUsize,
    peak_accepts_in_flight: AtomicUsize,
    open_sessions: AtomicUsize,
    peak_open_sessions: AtomicUsize,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_duration(&self) -> Duration {
        *self
            .lock_duration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Session-aware broker living entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                accept_timeout: Mutex::new(DEFAULT_ACCEPT_TIMEOUT),
                lock_duration: Mutex::new(DEFAULT_LOCK_DURATION),
                accept_calls: AtomicUsize::new(0),
                accepts_in_flight: AtomicUsize::new(0),
                peak_accepts_in_flight: AtomicUsize::new(0),
                open_sessions: AtomicUsize::new(0),
                peak_open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// How long an accept call waits for a claimable session before failing
    /// with `com.microsoft:timeout`. Zero fails immediately.
    #[must_use]
    pub fn with_accept_timeout(self, timeout: Duration) -> Self {
        *self
            .inner
            .accept_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
        self
    }

    /// Session and message lock duration granted on accept and renewal.
    #[must_use]
    pub fn with_lock_duration(self, duration: Duration) -> Self {
        *self
            .inner
            .lock_duration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = duration;
        self
    }

    /// Enqueue a message on `session_id`; returns its sequence number.
    pub fn send(&self, session_id: &str, body: impl Into<Vec<u8>>) -> i64 {
        let sequence_number = {
            let mut state = self.inner.lock_state();
            state.next_sequence += 1;
            let sequence_number = state.next_sequence;
            state
                .sessions
                .entry(session_id.to_string())
                .or_default()
                .messages
                .push_back(StoredMessage {
                    message_id: Uuid::new_v4().to_string(),
                    body: body.into(),
                    sequence_number,
                    delivery_count: 0,
                    enqueued_at: SystemTime::now(),
                    user_properties: UserProperties::new(),
                });
            sequence_number
        };
        self.inner.changed.notify_waiters();
        sequence_number
    }

    /// Fail the next accept call with `error`.
    pub fn fail_next_accept(&self, error: MessagingError) {
        self.inner.lock_state().accept_failures.push_back(error);
    }

    /// Fail the next receive on `session_id` with `error`.
    pub fn fail_next_receive(&self, session_id: &str, error: MessagingError) {
        self.inner
            .lock_state()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .receive_failures
            .push_back(error);
    }

    /// Fail the next lock renewal on `session_id` with `error`.
    pub fn fail_next_renewal(&self, session_id: &str, error: MessagingError) {
        self.inner
            .lock_state()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .renew_failures
            .push_back(error);
    }

    /// Total accept calls made so far.
    pub fn accept_calls(&self) -> usize {
        self.inner.accept_calls.load(Ordering::SeqCst)
    }

    /// Most accept calls ever in flight at once.
    pub fn peak_accepts_in_flight(&self) -> usize {
        self.inner.peak_accepts_in_flight.load(Ordering::SeqCst)
    }

    /// Sessions currently locked by a link.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Most sessions ever locked at once.
    pub fn peak_open_sessions(&self) -> usize {
        self.inner.peak_open_sessions.load(Ordering::SeqCst)
    }

    /// Messages waiting for delivery on `session_id`.
    pub fn pending(&self, session_id: &str) -> usize {
        self.inner
            .lock_state()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.messages.len())
    }

    /// IDs of completed messages, in completion order.
    pub fn completed(&self) -> Vec<String> {
        self.inner.lock_state().completed.clone()
    }

    /// Dead-lettered message IDs with the reason they were given.
    pub fn dead_lettered(&self) -> Vec<(String, DeadLetterOptions)> {
        self.inner.lock_state().dead_lettered.clone()
    }

    /// Number of deferred messages on `session_id`.
    pub fn deferred(&self, session_id: &str) -> usize {
        self.inner
            .lock_state()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.deferred.len())
    }

    /// Delivery count of the next pending message on `session_id`.
    pub fn next_delivery_count(&self, session_id: &str) -> Option<u32> {
        self.inner
            .lock_state()
            .sessions
            .get(session_id)
            .and_then(|s| s.messages.front())
            .map(|m| m.delivery_count)
    }

    pub fn session_state(&self, session_id: &str) -> Option<Vec<u8>> {
        self.inner
            .lock_state()
            .sessions
            .get(session_id)
            .and_then(|s| s.state.clone())
    }

    pub fn is_locked(&self, session_id: &str) -> bool {
        self.inner
            .lock_state()
            .sessions
            .get(session_id)
            .is_some_and(|s| s.locked)
    }

    fn accept_timeout(&self) -> Duration {
        *self
            .inner
            .accept_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock a session if one can be claimed right now.
    fn try_claim(
        &self,
        options: &AcceptSessionOptions,
    ) -> Result<Option<Arc<dyn SessionLink>>, MessagingError> {
        let session_id = {
            let mut state = self.inner.lock_state();
            if let Some(err) = state.accept_failures.pop_front() {
                return Err(err);
            }
            let claimed = if let Some(id) = &options.session_id {
                let session = state.sessions.entry(id.clone()).or_default();
                if session.locked {
                    return Err(MessagingError::new(
                        ErrorCondition::SessionCannotBeLocked,
                        format!("session '{id}' is locked by another receiver"),
                    ));
                }
                Some(id.clone())
            } else {
                state
                    .sessions
                    .iter()
                    .find(|(_, s)| !s.locked && !s.messages.is_empty())
                    .map(|(id, _)| id.clone())
            };
            let Some(session_id) = claimed else {
                return Ok(None);
            };
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.locked = true;
            }
            session_id
        };

        let open = self.inner.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .peak_open_sessions
            .fetch_max(open, Ordering::SeqCst);
        let locked_until = SystemTime::now() + self.inner.lock_duration();
        Ok(Some(Arc::new(MemoryLink {
            broker: Arc::clone(&self.inner),
            session_id,
            receive_mode: options.receive_mode,
            closed: AtomicBool::new(false),
            locked_until: Mutex::new(locked_until),
        })))
    }
}

/// Decrements the in-flight accept counter even if the call is dropped.
struct AcceptGuard<'a>(&'a AtomicUsize);

impl Drop for AcceptGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionAcceptor for MemoryBroker {
    async fn accept_next_session(
        &self,
        options: &AcceptSessionOptions,
    ) -> Result<Arc<dyn SessionLink>, MessagingError> {
        self.inner.accept_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.inner.accepts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .peak_accepts_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let _guard = AcceptGuard(&self.inner.accepts_in_flight);

        let deadline = Instant::now() + self.accept_timeout();
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(link) = self.try_claim(options)? {
                return Ok(link);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(MessagingError::new(
                    ErrorCondition::Timeout,
                    "no unlocked session became available",
                ));
            }
        }
    }
}

/// Link to one session locked in a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryLink {
    broker: Arc<Inner>,
    session_id: String,
    receive_mode: ReceiveMode,
    closed: AtomicBool,
    locked_until: Mutex<SystemTime>,
}

impl MemoryLink {
    fn lock_lost(&self) -> MessagingError {
        MessagingError::new(
            ErrorCondition::SessionLockLost,
            format!("link to session '{}' is closed", self.session_id),
        )
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::Acquire) {
            Err(self.lock_lost())
        } else {
            Ok(())
        }
    }

    /// Take the next message if one is queued.
    fn try_take(&self) -> Result<Option<ReceivedMessage>, MessagingError> {
        self.ensure_open()?;
        let lock_duration = self.broker.lock_duration();
        let mut state = self.broker.lock_state();
        let session = state.sessions.entry(self.session_id.clone()).or_default();
        if let Some(err) = session.receive_failures.pop_front() {
            return Err(err);
        }
        let Some(stored) = session.messages.pop_front() else {
            return Ok(None);
        };
        let mut message = ReceivedMessage::new(
            stored.message_id.clone(),
            self.session_id.clone(),
            stored.body.clone(),
            stored.sequence_number,
        );
        message.delivery_count = stored.delivery_count;
        message.enqueued_at = stored.enqueued_at;
        message.user_properties.clone_from(&stored.user_properties);
        let message = match self.receive_mode {
            ReceiveMode::PeekLock => {
                let token = Uuid::new_v4();
                session.in_flight.insert(token, stored);
                message.with_lock(token, SystemTime::now() + lock_duration)
            }
            ReceiveMode::ReceiveAndDelete => message.pre_settled(),
        };
        Ok(Some(message))
    }
}

#[async_trait]
impl SessionLink for MemoryLink {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn locked_until(&self) -> SystemTime {
        *self
            .locked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn receive(&self, max_wait: Duration) -> Result<ReceivedMessage, MessagingError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let changed = self.broker.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(message) = self.try_take()? {
                return Ok(message);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(MessagingError::new(
                    ErrorCondition::MessageWaitTimeout,
                    format!("no message on session '{}'", self.session_id),
                ));
            }
        }
    }

    async fn settle(
        &self,
        lock_token: Uuid,
        disposition: Disposition,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        {
            let mut guard = self.broker.lock_state();
            let state = &mut *guard;
            let session = state.sessions.entry(self.session_id.clone()).or_default();
            let Some(mut stored) = session.in_flight.remove(&lock_token) else {
                return Err(MessagingError::new(
                    ErrorCondition::MessageLockLost,
                    format!("lock token {lock_token} is not held"),
                ));
            };
            match disposition {
                Disposition::Complete => state.completed.push(stored.message_id),
                Disposition::Abandon {
                    properties_to_modify,
                } => {
                    stored.delivery_count += 1;
                    stored.user_properties.extend(properties_to_modify);
                    session.messages.push_front(stored);
                }
                Disposition::Defer {
                    properties_to_modify,
                } => {
                    stored.user_properties.extend(properties_to_modify);
                    session.deferred.push(stored);
                }
                Disposition::DeadLetter(options) => {
                    state.dead_lettered.push((stored.message_id, options));
                }
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn renew_lock(&self) -> Result<SystemTime, MessagingError> {
        self.ensure_open()?;
        let scripted = self
            .broker
            .lock_state()
            .sessions
            .get_mut(&self.session_id)
            .and_then(|s| s.renew_failures.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        let until = SystemTime::now() + self.broker.lock_duration();
        *self
            .locked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = until;
        Ok(until)
    }

    async fn get_state(&self) -> Result<Option<Vec<u8>>, MessagingError> {
        self.ensure_open()?;
        Ok(self
            .broker
            .lock_state()
            .sessions
            .get(&self.session_id)
            .and_then(|s| s.state.clone()))
    }

    async fn set_state(&self, state: Option<Vec<u8>>) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker
            .lock_state()
            .sessions
            .entry(self.session_id.clone())
            .or_default()
            .state = state;
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut state = self.broker.lock_state();
            if let Some(session) = state.sessions.get_mut(&self.session_id) {
                session.locked = false;
                let mut unsettled: Vec<StoredMessage> =
                    session.in_flight.drain().map(|(_, m)| m).collect();
                unsettled.sort_by_key(|m| std::cmp::Reverse(m.sequence_number));
                for mut message in unsettled {
                    message.delivery_count += 1;
                    session.messages.push_front(message);
                }
            }
        }
        self.broker.open_sessions.fetch_sub(1, Ordering::SeqCst);
        self.broker.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn peek_lock() -> AcceptSessionOptions {
        AcceptSessionOptions::default()
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out_without_sessions() {
        let broker = MemoryBroker::new().with_accept_timeout(Duration::from_secs(5));
        let err = broker.accept_next_session(&peek_lock()).await.err().unwrap();
        assert_eq!(err.condition, ErrorCondition::Timeout);
        assert_eq!(broker.accept_calls(), 1);
        assert_eq!(broker.peak_accepts_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_wakes_when_message_arrives() {
        let broker = MemoryBroker::new();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.accept_next_session(&peek_lock()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.send("s1", b"hello".to_vec());
        let link = waiter.await.unwrap().unwrap();
        assert_eq!(link.session_id(), "s1");
        assert!(broker.is_locked("s1"));
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn locked_session_is_not_handed_out_twice() {
        let broker = MemoryBroker::new().with_accept_timeout(Duration::ZERO);
        broker.send("s1", b"a".to_vec());
        let _link = broker.accept_next_session(&peek_lock()).await.unwrap();

        let err = broker.accept_next_session(&peek_lock()).await.err().unwrap();
        assert_eq!(err.condition, ErrorCondition::Timeout);

        let named = AcceptSessionOptions {
            session_id: Some("s1".to_string()),
            ..AcceptSessionOptions::default()
        };
        let err = broker.accept_next_session(&named).await.err().unwrap();
        assert_eq!(err.condition, ErrorCondition::SessionCannotBeLocked);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_redelivers_with_higher_delivery_count() {
        let broker = MemoryBroker::new();
        broker.send("s1", b"a".to_vec());
        let link = broker.accept_next_session(&peek_lock()).await.unwrap();
        let msg = link.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.delivery_count, 0);

        link.settle(
            msg.lock_token.unwrap(),
            Disposition::Abandon {
                properties_to_modify: UserProperties::new(),
            },
        )
        .await
        .unwrap();
        let again = link.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.message_id, msg.message_id);
        assert_eq!(again.delivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settling_twice_reports_lock_lost() {
        let broker = MemoryBroker::new();
        broker.send("s1", b"a".to_vec());
        let link = broker.accept_next_session(&peek_lock()).await.unwrap();
        let msg = link.receive(Duration::from_secs(1)).await.unwrap();
        let token = msg.lock_token.unwrap();
        link.settle(token, Disposition::Complete).await.unwrap();
        let err = link.settle(token, Disposition::Complete).await.unwrap_err();
        assert_eq!(err.condition, ErrorCondition::MessageLockLost);
        assert_eq!(broker.completed(), vec![msg.message_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_on_empty_session() {
        let broker = MemoryBroker::new();
        broker.send("s1", b"a".to_vec());
        let link = broker.accept_next_session(&peek_lock()).await.unwrap();
        link.receive(Duration::from_secs(1)).await.unwrap();
        let err = link.receive(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.condition, ErrorCondition::MessageWaitTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn close_unlocks_and_requeues_unsettled() {
        let broker = MemoryBroker::new();
        broker.send("s1", b"a".to_vec());
        let link = broker.accept_next_session(&peek_lock()).await.unwrap();
        link.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(broker.pending("s1"), 0);

        link.close().await.unwrap();
        link.close().await.unwrap();
        assert!(!broker.is_locked("s1"));
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.pending("s1"), 1);
        assert_eq!(broker.next_delivery_count("s1"), Some(1));

        let err = link.receive(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.condition, ErrorCondition::SessionLockLost);
    }

    #[tokio::test(start_paused = true)]
    async fn session_state_round_trips() {
        let broker = MemoryBroker::new();
        broker.send("s1", b"a".to_vec());
        let link = broker.accept_next_session(&peek_lock()).await.unwrap();
        assert_eq!(link.get_state().await.unwrap(), None);
        link.set_state(Some(b"cursor=4".to_vec())).await.unwrap();
        assert_eq!(broker.session_state("s1"), Some(b"cursor=4".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_failures_fire_once() {
        let broker = MemoryBroker::new().with_accept_timeout(Duration::ZERO);
        broker.send("s1", b"a".to_vec());
        broker.fail_next_accept(MessagingError::new(
            ErrorCondition::ServerBusy,
            "busy",
        ));
        let err = broker.accept_next_session(&peek_lock()).await.err().unwrap();
        assert_eq!(err.condition, ErrorCondition::ServerBusy);

        let link = broker.accept_next_session(&peek_lock()).await.unwrap();
        broker.fail_next_renewal(
            "s1",
            MessagingError::new(ErrorCondition::SessionLockLost, "expired"),
        );
        assert!(link.renew_lock().await.is_err());
        assert!(link.renew_lock().await.is_ok());
    }
}
