//! Queue client traits
//!
//! The worker only needs two capabilities from a queue: receive a batch and
//! delete a set of messages. Concrete transports implement these traits.

use crate::error::QueueError;
use crate::message::Message;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Receives batches of messages.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Receive the next batch.
    ///
    /// Blocks until messages are available, the poll times out (returning an
    /// empty batch) or `cancel` fires. On cancellation implementations must
    /// return [`QueueError::Cancelled`] instead of hanging.
    async fn receive_messages(&self, cancel: &CancellationToken)
    -> Result<Vec<Message>, QueueError>;
}

/// Deletes (acknowledges) processed messages.
#[async_trait]
pub trait MessageDeleter: Send + Sync {
    /// Delete the given messages.
    ///
    /// Best effort: when only some messages are deleted this returns
    /// [`QueueError::PartialDelete`] listing the ones that were not.
    async fn delete_messages(&self, messages: &[Message]) -> Result<(), QueueError>;
}

/// A queue client able to both receive and delete.
pub trait QueueClient: MessageReceiver + MessageDeleter {}

impl<T: MessageReceiver + MessageDeleter> QueueClient for T {}
