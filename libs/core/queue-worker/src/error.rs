//! Worker error types and error categorization
//!
//! Errors are split by the boundary they cross:
//! - **QueueError**: returned by a queue client (receive/delete)
//! - **HandlerError**: returned by consumer handlers
//! - **WorkerError**: everything the pool reports to its controller

use std::time::Duration;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Kind of a reported error, used for logging and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Receiving a batch failed
    Receive,
    /// Deleting processed messages failed
    Delete,
    /// A message was not claimed before its visibility timeout
    MessageTimeout,
    /// A handler rejected a message or ran past its deadline
    Handler,
    /// No consumer is left to read the message channel
    ChannelClosed,
    /// Invalid worker configuration
    Config,
    /// The controller shut the pool down after too many errors
    ThresholdReached,
}

/// Errors returned by a queue client
#[derive(Error, Debug)]
pub enum QueueError {
    /// The call observed cancellation before completing
    #[error("operation cancelled")]
    Cancelled,

    /// The request did not complete in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Network or service failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Some messages of a delete call were not acknowledged
    #[error("failed to delete {} of {total} messages", failed.len())]
    PartialDelete { failed: Vec<String>, total: usize },
}

impl QueueError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        QueueError::Transport(message.into())
    }

    /// Check if this error is a cancellation signal.
    ///
    /// Only a cancellation *shape*: the retriever still checks its own token
    /// before treating the error as a shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

/// Errors returned by message handlers
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler rejected the message
    #[error("{0}")]
    Failed(String),

    /// The handler did not finish before the message deadline
    #[error("handler exceeded the message deadline")]
    DeadlineExceeded,
}

impl HandlerError {
    /// Create a failed handler error
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

/// Errors reported by the worker pool
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("unable to receive messages: {0}")]
    Receive(#[source] QueueError),

    #[error("unable to delete messages: {0}")]
    Delete(#[source] QueueError),

    #[error("message {message_id} didn't get picked up by any consumer within its timeout")]
    MessageTimeout { message_id: String },

    #[error("failed to process message {message_id}: {source}")]
    Handler {
        message_id: String,
        #[source]
        source: HandlerError,
    },

    #[error("failed to process batch of {size} messages: {source}")]
    BatchHandler {
        size: usize,
        #[source]
        source: HandlerError,
    },

    #[error("message channel closed, no consumer is running")]
    ChannelClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("too many errors: {count} within {period:?}")]
    ErrorThresholdReached { count: u32, period: Duration },
}

impl WorkerError {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Receive(_) => ErrorKind::Receive,
            WorkerError::Delete(_) => ErrorKind::Delete,
            WorkerError::MessageTimeout { .. } => ErrorKind::MessageTimeout,
            WorkerError::Handler { .. } => ErrorKind::Handler,
            WorkerError::BatchHandler { .. } => ErrorKind::Handler,
            WorkerError::ChannelClosed => ErrorKind::ChannelClosed,
            WorkerError::Config(_) => ErrorKind::Config,
            WorkerError::ErrorThresholdReached { .. } => ErrorKind::ThresholdReached,
        }
    }

    /// Check if the pool can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            WorkerError::ChannelClosed
                | WorkerError::Config(_)
                | WorkerError::ErrorThresholdReached { .. }
        )
    }
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;
