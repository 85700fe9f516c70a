//! Queue Worker Framework
//!
//! A worker pool for visibility-timeout queues (SQS-style): messages received
//! from the queue stay hidden for a while, and reappear unless deleted.
//!
//! ## Features
//!
//! - **Retriever loop**: polls the queue and hands messages to consumers over
//!   a bounded channel, never holding a message past its visibility deadline
//! - **Consumer pool**: single-message or buffered batch handlers, bounded by
//!   the message deadline, deleting what succeeded
//! - **Controller**: one place errors are reported to, with an optional error
//!   threshold that shuts the pool down
//! - **Cooperative shutdown**: everything observes one `CancellationToken`
//! - **Prometheus metrics**: built-in observability
//! - **MemoryQueue**: an in-process queue for tests and demos
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{Consumer, MemoryQueue, MessageHandler, Worker, WorkerConfig};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
//!         println!("{}", message.body);
//!         Ok(())
//!     }
//! }
//!
//! let queue = Arc::new(MemoryQueue::default());
//! let worker = Worker::new(queue, Consumer::single(Echo), WorkerConfig::new("echo"));
//! worker.run(shutdown_token).await?;
//! ```

mod backoff;
mod client;
mod config;
mod consumer;
mod controller;
mod error;
mod memory;
mod message;
pub mod metrics;
mod retriever;
mod worker;

// Re-export main types
pub use backoff::Backoff;
pub use client::{MessageDeleter, MessageReceiver, QueueClient};
pub use config::WorkerConfig;
pub use consumer::{
    BatchHandler, BatchOutcome, BufferConfig, Consumer, MessageHandler, SharedReceiver,
};
pub use controller::{Controller, ErrorReporter, ErrorThreshold};
pub use error::{ErrorKind, HandlerError, QueueError, Result, WorkerError};
pub use memory::{MemoryQueue, MemoryQueueConfig};
pub use message::Message;
pub use crate::metrics::{WorkerMetrics, init_metrics, render_metrics};
pub use retriever::Retriever;
pub use worker::Worker;

// Re-exported so embedders don't need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
