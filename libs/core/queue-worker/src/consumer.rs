//! Consumers draining the message channel.
//!
//! This module provides:
//! - `MessageHandler` trait for handling one message at a time
//! - `BatchHandler` trait for handling buffered batches
//! - `Consumer` describing which of the two a pool runs
//!
//! Handlers run bounded by the visibility deadline of the messages they
//! were given. Successfully handled messages are deleted; every failure is
//! reported to the controller and the message is left for the queue to
//! redeliver.

use crate::client::MessageDeleter;
use crate::controller::Controller;
use crate::error::{HandlerError, WorkerError};
use crate::message::Message;
use crate::metrics::{ProcessStatus, WorkerMetrics};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Receiver half of the message channel, shared by all consumer tasks.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Message>>>;

/// Trait for single-message handlers.
///
/// # Example
///
/// ```rust,ignore
/// use queue_worker::{HandlerError, Message, MessageHandler};
///
/// struct InvoiceHandler;
///
/// #[async_trait]
/// impl MessageHandler for InvoiceHandler {
///     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
///         let invoice: Invoice = serde_json::from_str(&message.body)
///             .map_err(|e| HandlerError::failed(e.to_string()))?;
///         book(invoice).await.map_err(|e| HandlerError::failed(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a single message.
    ///
    /// Return `Ok(())` to have the message deleted.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;

    /// Get the handler name for logging.
    fn name(&self) -> &'static str {
        "message_handler"
    }
}

/// Trait for batch handlers.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Handle a batch of messages.
    ///
    /// Messages not listed as failed in the outcome are deleted.
    async fn handle_batch(&self, messages: &[Message]) -> BatchOutcome;

    /// Get the handler name for logging.
    fn name(&self) -> &'static str {
        "batch_handler"
    }
}

/// Result of handling a batch: the messages that failed and why.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    failed: Vec<(String, HandlerError)>,
}

impl BatchOutcome {
    /// Every message succeeded
    pub fn success() -> Self {
        Self::default()
    }

    /// Mark a message as failed
    pub fn with_failure(mut self, message_id: impl Into<String>, error: HandlerError) -> Self {
        self.failed.push((message_id.into(), error));
        self
    }

    /// Mark a message as failed
    pub fn fail(&mut self, message_id: impl Into<String>, error: HandlerError) {
        self.failed.push((message_id.into(), error));
    }

    pub fn failed(&self) -> &[(String, HandlerError)] {
        &self.failed
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// How many messages a batch consumer buffers, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Maximum messages per batch
    pub size: usize,
    /// How long to wait for the buffer to fill after the first message
    pub timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 10,
            timeout: Duration::from_secs(1),
        }
    }
}

/// The consumer a pool runs.
#[derive(Clone)]
pub enum Consumer {
    /// Handle messages one at a time
    Single(Arc<dyn MessageHandler>),
    /// Buffer messages and handle them in batches
    Batch {
        handler: Arc<dyn BatchHandler>,
        buffer: BufferConfig,
    },
}

impl Consumer {
    /// Create a single-message consumer
    pub fn single(handler: impl MessageHandler + 'static) -> Self {
        Consumer::Single(Arc::new(handler))
    }

    /// Create a batch consumer
    pub fn batch(handler: impl BatchHandler + 'static, buffer: BufferConfig) -> Self {
        Consumer::Batch {
            handler: Arc::new(handler),
            buffer,
        }
    }

    /// Get the handler name
    pub fn name(&self) -> &'static str {
        match self {
            Consumer::Single(handler) => handler.name(),
            Consumer::Batch { handler, .. } => handler.name(),
        }
    }

    /// Drain the channel until it is closed and empty.
    pub async fn run(
        self,
        receiver: SharedReceiver,
        deleter: Arc<dyn MessageDeleter>,
        controller: Controller,
        metrics: WorkerMetrics,
    ) {
        let task = ConsumerTask {
            deleter,
            controller,
            metrics,
        };

        match self {
            Consumer::Single(handler) => {
                while let Some(msg) = next_message(&receiver).await {
                    task.process(handler.as_ref(), msg).await;
                }
            }
            Consumer::Batch { handler, buffer } => {
                let buffer = BufferConfig {
                    size: buffer.size.max(1),
                    ..buffer
                };
                loop {
                    let batch = next_batch(&receiver, buffer).await;
                    if batch.is_empty() {
                        break;
                    }
                    task.process_batch(handler.as_ref(), batch).await;
                }
            }
        }

        debug!("Consumer stopped");
    }
}

async fn next_message(receiver: &SharedReceiver) -> Option<Message> {
    receiver.lock().await.recv().await
}

/// Wait for a first message, then fill the buffer until it is full, the
/// timeout elapses, or the channel closes.
async fn next_batch(receiver: &SharedReceiver, buffer: BufferConfig) -> Vec<Message> {
    let mut batch = Vec::with_capacity(buffer.size);

    let Some(first) = next_message(receiver).await else {
        return batch;
    };
    batch.push(first);

    let flush_at = tokio::time::Instant::now() + buffer.timeout;
    while batch.len() < buffer.size {
        tokio::select! {
            msg = next_message(receiver) => match msg {
                Some(msg) => batch.push(msg),
                None => break,
            },
            _ = tokio::time::sleep_until(flush_at) => break,
        }
    }

    batch
}

struct ConsumerTask {
    deleter: Arc<dyn MessageDeleter>,
    controller: Controller,
    metrics: WorkerMetrics,
}

impl ConsumerTask {
    async fn process(&self, handler: &dyn MessageHandler, msg: Message) {
        debug!(message_id = %msg.id, handler = handler.name(), "Processing message");

        let start = Instant::now();
        let result = tokio::time::timeout_at(msg.deadline(), handler.handle(&msg)).await;

        let source = match result {
            Ok(Ok(())) => {
                self.metrics
                    .messages_processed(ProcessStatus::Success, 1, start.elapsed());
                self.delete(std::slice::from_ref(&msg)).await;
                return;
            }
            Ok(Err(e)) => {
                self.metrics
                    .messages_processed(ProcessStatus::Failed, 1, start.elapsed());
                e
            }
            Err(_) => {
                self.metrics
                    .messages_processed(ProcessStatus::DeadlineExceeded, 1, start.elapsed());
                HandlerError::DeadlineExceeded
            }
        };

        self.controller.report_error(WorkerError::Handler {
            message_id: msg.id,
            source,
        });
    }

    async fn process_batch(&self, handler: &dyn BatchHandler, batch: Vec<Message>) {
        let size = batch.len();
        let Some(deadline) = batch.iter().map(Message::deadline).min() else {
            return;
        };

        debug!(size, handler = handler.name(), "Processing batch");

        let start = Instant::now();
        let outcome = match tokio::time::timeout_at(deadline, handler.handle_batch(&batch)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.metrics
                    .messages_processed(ProcessStatus::DeadlineExceeded, size, start.elapsed());
                self.controller.report_error(WorkerError::BatchHandler {
                    size,
                    source: HandlerError::DeadlineExceeded,
                });
                return;
            }
        };

        let failed_ids: HashSet<&str> = outcome.failed.iter().map(|(id, _)| id.as_str()).collect();
        let succeeded: Vec<Message> = batch
            .iter()
            .filter(|msg| !failed_ids.contains(msg.id.as_str()))
            .cloned()
            .collect();
        let failed_count = size - succeeded.len();

        if failed_count > 0 {
            self.metrics
                .messages_processed(ProcessStatus::Failed, failed_count, start.elapsed());
        }
        if !succeeded.is_empty() {
            self.metrics
                .messages_processed(ProcessStatus::Success, succeeded.len(), start.elapsed());
            self.delete(&succeeded).await;
        }

        for (message_id, source) in outcome.failed {
            self.controller
                .report_error(WorkerError::Handler { message_id, source });
        }
    }

    async fn delete(&self, messages: &[Message]) {
        if let Err(e) = self.deleter.delete_messages(messages).await {
            warn!(count = messages.len(), error = %e, "Failed to delete messages");
            self.controller.report_error(WorkerError::Delete(e));
        }
    }
}
