//! In-memory queue client.
//!
//! Behaves like a managed queue with visibility timeouts: received messages
//! are hidden until deleted or until their visibility timeout runs out, at
//! which point they become receivable again. Receives long-poll up to
//! `wait_time`. Used by tests and demos; state is lost on drop.

use crate::client::{MessageDeleter, MessageReceiver};
use crate::error::QueueError;
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Configuration for a [`MemoryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryQueueConfig {
    /// Maximum messages returned by one receive (at least 1)
    pub max_messages: usize,
    /// How long a received message stays hidden
    pub visibility_timeout: Duration,
    /// How long an empty receive waits before returning nothing
    pub wait_time: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            visibility_timeout: Duration::from_secs(30),
            wait_time: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    /// Send order, used to requeue expired messages in their original order
    seq: u64,
    id: String,
    body: String,
    attributes: HashMap<String, String>,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// Keyed by receipt handle
    in_flight: HashMap<String, InFlight>,
    deleted: u64,
    next_seq: u64,
}

impl QueueState {
    /// Move in-flight messages whose visibility timeout ran out back to the
    /// front of the queue, oldest first.
    fn release_expired(&mut self, now: Instant) {
        let receipts: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        let mut expired: Vec<StoredMessage> = receipts
            .iter()
            .filter_map(|receipt| self.in_flight.remove(receipt))
            .map(|entry| entry.message)
            .collect();
        expired.sort_by_key(|message| message.seq);

        // Pushing newest first leaves the oldest at the very front.
        for message in expired.into_iter().rev() {
            debug!(message_id = %message.id, "Visibility timeout elapsed, message visible again");
            self.ready.push_front(message);
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.visible_at).min()
    }
}

/// An in-process queue implementing [`MessageReceiver`] and [`MessageDeleter`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    config: MemoryQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue
    ///
    /// A `max_messages` of 0 is raised to 1 so a receive can always make
    /// progress.
    pub fn new(config: MemoryQueueConfig) -> Self {
        let config = MemoryQueueConfig {
            max_messages: config.max_messages.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &MemoryQueueConfig {
        &self.config
    }

    /// Enqueue a message, returning its ID
    pub fn send(&self, body: impl Into<String>) -> String {
        self.send_with_attributes(body, HashMap::new())
    }

    /// Enqueue a message with attributes, returning its ID
    pub fn send_with_attributes(
        &self,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push_back(StoredMessage {
            seq,
            id: id.clone(),
            body: body.into(),
            attributes,
            receive_count: 0,
        });
        drop(state);
        self.notify.notify_waiters();
        id
    }

    /// Messages waiting to be received
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages received but neither deleted nor visible again yet
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Messages deleted so far
    pub fn deleted(&self) -> u64 {
        self.state.lock().deleted
    }

    /// Take up to `max_messages` visible messages, or report when the next
    /// in-flight message becomes visible again.
    fn take_batch(&self) -> Result<Vec<Message>, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.release_expired(now);

        if state.ready.is_empty() {
            return Err(state.next_visible_at());
        }

        let visible_at = now + self.config.visibility_timeout;
        let count = state.ready.len().min(self.config.max_messages);
        let taken: Vec<StoredMessage> = state.ready.drain(..count).collect();
        let mut batch = Vec::with_capacity(count);

        for mut stored in taken {
            stored.receive_count += 1;
            let receipt = Uuid::new_v4().to_string();

            let mut msg = Message::with_deadline(
                stored.id.clone(),
                receipt.clone(),
                stored.body.clone(),
                visible_at,
            )
            .with_receive_count(stored.receive_count);
            msg.attributes = stored.attributes.clone();

            state.in_flight.insert(
                receipt,
                InFlight {
                    message: stored,
                    visible_at,
                },
            );
            batch.push(msg);
        }

        Ok(batch)
    }
}

#[async_trait]
impl MessageReceiver for MemoryQueue {
    async fn receive_messages(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, QueueError> {
        let wait_until = Instant::now() + self.config.wait_time;

        loop {
            // Register before checking so a concurrent send cannot be missed.
            let notified = self.notify.notified();

            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let wake_at = match self.take_batch() {
                Ok(batch) => return Ok(batch),
                Err(Some(visible_at)) => visible_at.min(wait_until),
                Err(None) => wait_until,
            };

            if Instant::now() >= wait_until {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

#[async_trait]
impl MessageDeleter for MemoryQueue {
    async fn delete_messages(&self, messages: &[Message]) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let mut failed = Vec::new();

        for msg in messages {
            match state.in_flight.remove(&msg.receipt_handle) {
                Some(_) => state.deleted += 1,
                None => failed.push(msg.id.clone()),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(QueueError::PartialDelete {
                failed,
                total: messages.len(),
            })
        }
    }
}
