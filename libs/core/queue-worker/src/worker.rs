//! The worker pool.
//!
//! `Worker` wires one retriever, a bounded channel and `concurrency`
//! consumer tasks around a single controller, and runs them until the
//! caller's shutdown token (or the controller's error threshold) stops it.

use crate::client::{MessageDeleter, MessageReceiver, QueueClient};
use crate::config::WorkerConfig;
use crate::consumer::{Consumer, SharedReceiver};
use crate::controller::{Controller, ErrorReporter};
use crate::error::WorkerError;
use crate::metrics::WorkerMetrics;
use crate::retriever::Retriever;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A queue worker pool.
///
/// # Example
///
/// ```rust,ignore
/// use queue_worker::{Consumer, MemoryQueue, Worker, WorkerConfig};
///
/// let queue = Arc::new(MemoryQueue::default());
/// let worker = Worker::new(queue, Consumer::single(InvoiceHandler), WorkerConfig::new("invoices"))
///     .with_error_reporter(|err| !matches!(err, WorkerError::MessageTimeout { .. }));
///
/// let shutdown = CancellationToken::new();
/// worker.run(shutdown.clone()).await?;
/// ```
pub struct Worker<C: QueueClient + 'static> {
    client: Arc<C>,
    consumer: Consumer,
    config: WorkerConfig,
    reporter: ErrorReporter,
}

impl<C: QueueClient + 'static> Worker<C> {
    /// Create a new worker. Every error counts toward the threshold.
    pub fn new(client: Arc<C>, consumer: Consumer, config: WorkerConfig) -> Self {
        Self {
            client,
            consumer,
            config,
            reporter: Arc::new(|_: &WorkerError| true),
        }
    }

    /// Set the callback every reported error is passed to.
    ///
    /// The callback returns whether the error counts toward the configured
    /// error threshold.
    pub fn with_error_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&WorkerError) -> bool + Send + Sync + 'static,
    {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the pool until `shutdown` is cancelled.
    ///
    /// Messages already handed to the consumers are still processed before
    /// this returns. Returns [`WorkerError::ErrorThresholdReached`] when the
    /// pool stopped because of too many errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.config.validate()?;

        let metrics = WorkerMetrics::new(self.config.name.clone());
        let controller = Controller::with_reporter(
            &shutdown,
            metrics.clone(),
            self.config.error_threshold,
            Arc::clone(&self.reporter),
        );

        info!(
            worker = %self.config.name,
            handler = %self.consumer.name(),
            concurrency = self.config.concurrency,
            channel_capacity = self.config.channel_capacity,
            error_threshold = ?self.config.error_threshold,
            "Starting queue worker"
        );

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));
        let deleter: Arc<dyn MessageDeleter> = self.client.clone();

        let mut consumers = JoinSet::new();
        for _ in 0..self.config.concurrency {
            consumers.spawn(self.consumer.clone().run(
                Arc::clone(&receiver),
                Arc::clone(&deleter),
                controller.clone(),
                metrics.clone(),
            ));
        }
        // Consumers own the receiver now; once all of them are gone the
        // retriever sees a closed channel.
        drop(receiver);

        let client: Arc<dyn MessageReceiver> = self.client;
        Retriever::new(client, controller.clone(), sender)
            .with_backoff(self.config.backoff)
            .with_metrics(metrics)
            .run()
            .await;

        while let Some(result) = consumers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Consumer task failed");
            }
        }

        info!(
            worker = %self.config.name,
            errors_reported = controller.errors_reported(),
            "Queue worker stopped"
        );

        match controller.threshold_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
