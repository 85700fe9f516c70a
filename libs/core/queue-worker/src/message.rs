//! Queue message wrapper
//!
//! Wraps an opaque payload with its queue metadata and the deadline at which
//! its visibility timeout runs out.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A message received from the queue
#[derive(Debug, Clone)]
pub struct Message {
    /// Queue-assigned message ID
    pub id: String,

    /// Handle used to acknowledge this particular delivery
    pub receipt_handle: String,

    /// The raw payload, never interpreted by the worker
    pub body: String,

    /// Queue-provided attributes
    pub attributes: HashMap<String, String>,

    /// When the message was received
    pub received_at: DateTime<Utc>,

    /// Number of times this message has been delivered
    pub receive_count: u32,

    /// End of the visibility-timeout window
    deadline: Instant,
}

impl Message {
    /// Create a message whose deadline is `visibility_timeout` from now
    pub fn new(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self::with_deadline(id, receipt_handle, body, Instant::now() + visibility_timeout)
    }

    /// Create a message with an explicit deadline
    pub fn with_deadline(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
        deadline: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes: HashMap::new(),
            received_at: Utc::now(),
            receive_count: 1,
            deadline,
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the delivery count
    pub fn with_receive_count(mut self, receive_count: u32) -> Self {
        self.receive_count = receive_count;
        self
    }

    /// Get the deadline
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the visibility timeout runs out
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Check if the visibility timeout has run out
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }

    /// Get how long ago the message was received
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.received_at
    }
}
