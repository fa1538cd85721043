//! In-process implementations of the queue, store and dead-letter traits.
//!
//! These behave like the real backends where it matters for delivery guarantees (leases, fresh
//! receipt tokens per delivery, uniqueness of message ids) and can be told to fail on demand.
//! They are always available so tests in dependent crates can use them.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use crate::login::NormalizedLoginRecord;
use crate::queue::{AckError, MessageSource, QueueMessage, SourceError};
use crate::store::{InsertOutcome, LoginStore, StoreError};

struct Lease {
    token: String,
    until: Instant,
}

struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    receive_count: u32,
    lease: Option<Lease>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        match &self.lease {
            Some(lease) => lease.until <= now,
            None => true,
        }
    }
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    messages: Vec<StoredMessage>,
    acknowledged: HashMap<String, u32>,
    failing_receives: u32,
    failing_deletes: u32,
}

/// A queue with visibility timeouts, kept in memory.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    visibility_timeout: time::Duration,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: time::Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
            notify: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A panic while holding the lock can only come from a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send a message, returning the id it was assigned.
    pub fn enqueue(&self, body: &[u8]) -> String {
        let message_id = {
            let mut state = self.state();
            state.next_id += 1;
            let message_id = format!("message-{}", state.next_id);
            state.messages.push(StoredMessage {
                message_id: message_id.clone(),
                body: body.to_vec(),
                receive_count: 0,
                lease: None,
            });
            message_id
        };
        self.notify.notify_waiters();
        message_id
    }

    /// Make every in-flight message visible again, as if all leases had run out.
    pub fn expire_leases(&self) {
        let now = Instant::now();
        for message in self.state().messages.iter_mut() {
            if let Some(lease) = message.lease.as_mut() {
                lease.until = now;
            }
        }
        self.notify.notify_waiters();
    }

    /// The next `n` receive calls fail with a transient error.
    pub fn fail_next_receives(&self, n: u32) {
        self.state().failing_receives = n;
    }

    /// The next `n` delete calls fail with a transient error.
    pub fn fail_next_deletes(&self, n: u32) {
        self.state().failing_deletes = n;
    }

    /// Number of messages not yet acknowledged, leased or not.
    pub fn pending(&self) -> usize {
        self.state().messages.len()
    }

    /// Number of messages currently leased to a consumer.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state()
            .messages
            .iter()
            .filter(|m| !m.is_visible(now))
            .count()
    }

    /// How many times a message was successfully acknowledged.
    pub fn acknowledged_count(&self, message_id: &str) -> u32 {
        self.state()
            .acknowledged
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total successful acknowledgments across all messages.
    pub fn total_acknowledged(&self) -> u32 {
        self.state().acknowledged.values().sum()
    }

    /// Claim visible messages, or tell the caller when to look again.
    fn claim(
        &self,
        max_messages: usize,
    ) -> Result<(Vec<QueueMessage>, Option<Instant>), SourceError> {
        let mut state = self.state();

        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(SourceError::Transient("injected receive failure".to_owned()));
        }

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut next_expiry: Option<Instant> = None;

        for message in state.messages.iter_mut() {
            if !message.is_visible(now) {
                if let Some(lease) = &message.lease {
                    next_expiry = Some(next_expiry.map_or(lease.until, |e| e.min(lease.until)));
                }
                continue;
            }
            if claimed.len() == max_messages {
                break;
            }

            let token = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.lease = Some(Lease {
                token: token.clone(),
                until: now + self.visibility_timeout,
            });
            claimed.push(QueueMessage {
                message_id: message.message_id.clone(),
                token,
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }

        Ok((claimed, next_expiry))
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: time::Duration,
    ) -> Result<Vec<QueueMessage>, SourceError> {
        let deadline = Instant::now() + wait_time;

        loop {
            // Register interest before looking, so an enqueue in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (claimed, next_expiry) = self.claim(max_messages)?;
            if !claimed.is_empty() || Instant::now() >= deadline {
                return Ok(claimed);
            }

            let wake_at = next_expiry.map_or(deadline, |e| e.min(deadline));
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn delete(&self, token: &str) -> Result<(), AckError> {
        let mut state = self.state();

        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(AckError::Unavailable("injected delete failure".to_owned()));
        }

        let now = Instant::now();
        let position = state.messages.iter().position(|m| match &m.lease {
            Some(lease) => lease.token == token && lease.until > now,
            None => false,
        });

        match position {
            Some(index) => {
                let message = state.messages.remove(index);
                *state.acknowledged.entry(message.message_id).or_insert(0) += 1;
                Ok(())
            }
            None => Err(AckError::TokenExpired),
        }
    }
}

#[derive(Default)]
struct StoreState {
    rows: Vec<NormalizedLoginRecord>,
    failing_inserts: u32,
    rejecting_inserts: u32,
    insert_calls: u32,
}

/// A `user_logins` table kept in memory, unique on `message_id`.
#[derive(Default)]
pub struct MemoryLoginStore {
    state: Mutex<StoreState>,
}

impl MemoryLoginStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `n` inserts fail with a transient error.
    pub fn fail_next_inserts(&self, n: u32) {
        self.state().failing_inserts = n;
    }

    /// The next `n` inserts are rejected with a non-transient error.
    pub fn reject_next_inserts(&self, n: u32) {
        self.state().rejecting_inserts = n;
    }

    pub fn rows(&self) -> Vec<NormalizedLoginRecord> {
        self.state().rows.clone()
    }

    /// Number of insert calls received, including failed ones.
    pub fn insert_calls(&self) -> u32 {
        self.state().insert_calls
    }
}

#[async_trait]
impl LoginStore for MemoryLoginStore {
    async fn insert(&self, record: &NormalizedLoginRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state();
        state.insert_calls += 1;

        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Transient("injected insert failure".to_owned()));
        }
        if state.rejecting_inserts > 0 {
            state.rejecting_inserts -= 1;
            return Err(StoreError::Rejected("injected insert rejection".to_owned()));
        }

        if state.rows.iter().any(|r| r.message_id == record.message_id) {
            return Ok(InsertOutcome::Duplicate);
        }

        state.rows.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }
}

#[derive(Default)]
struct DeadLetterState {
    letters: Vec<DeadLetter>,
    failing_sends: u32,
}

/// A dead-letter sink kept in memory, unique on `message_id`.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    state: Mutex<DeadLetterState>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeadLetterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.state().failing_sends = n;
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.state().letters.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut state = self.state();

        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(DeadLetterError::Unavailable(
                "injected dead letter failure".to_owned(),
            ));
        }

        if !state.letters.iter().any(|l| l.message_id == letter.message_id) {
            state.letters.push(letter.clone());
        }
        Ok(())
    }
}
