//! The retriever loop.
//!
//! Polls the queue until the controller's token is cancelled and hands every
//! received message to the consumers over a bounded channel. Each handoff
//! races the channel send against the message's visibility deadline.

use crate::backoff::Backoff;
use crate::client::MessageReceiver;
use crate::controller::Controller;
use crate::error::WorkerError;
use crate::message::Message;
use crate::metrics::WorkerMetrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of handing one batch to the consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Every message was accepted by the channel.
    Complete,
    /// A deadline ran out; the rest of the batch was dropped.
    Expired,
    /// No receiver is left on the channel.
    Closed,
}

/// Drives the poll loop for one pool run.
pub struct Retriever {
    receiver: Arc<dyn MessageReceiver>,
    controller: Controller,
    sender: mpsc::Sender<Message>,
    backoff: Backoff,
    metrics: WorkerMetrics,
}

impl Retriever {
    /// Create a retriever.
    ///
    /// The retriever becomes the sole writer of the channel; dropping it (when
    /// [`run`](Self::run) returns) closes the channel for the consumers.
    pub fn new(
        receiver: Arc<dyn MessageReceiver>,
        controller: Controller,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            receiver,
            controller,
            sender,
            backoff: Backoff::None,
            metrics: WorkerMetrics::new("default"),
        }
    }

    /// Set the delay applied after operational receive errors.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the metrics labels.
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run until the controller is cancelled.
    ///
    /// Cancellation is only checked between polls: a batch already received
    /// is always fully delivered or explicitly reported.
    pub async fn run(self) {
        let token = self.controller.cancellation_token().clone();
        let mut consecutive_errors: u32 = 0;

        info!("Retriever started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let batch = match self.receiver.receive_messages(&token).await {
                Ok(batch) => batch,
                Err(e) if e.is_cancelled() && token.is_cancelled() => break,
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.controller.report_error(WorkerError::Receive(e));
                    if !self.backoff.wait(consecutive_errors, &token).await {
                        break;
                    }
                    continue;
                }
            };

            if consecutive_errors > 0 {
                info!(consecutive_errors, "Receive recovered");
                consecutive_errors = 0;
            }

            if batch.is_empty() {
                debug!("Empty poll");
                // A client returning empty batches without waiting must not
                // starve the other tasks on this runtime.
                tokio::task::yield_now().await;
                continue;
            }

            self.metrics.batch_received(batch.len());

            if self.deliver(batch).await == Delivery::Closed {
                warn!("Message channel closed, stopping retriever");
                break;
            }
        }

        info!("Retriever stopped");
    }

    /// Offer each message of a batch to the channel in order.
    ///
    /// All messages of one receive call share a visibility window, so once one
    /// of them expires unclaimed the remainder is stale as well and is left to
    /// the queue's own redelivery.
    async fn deliver(&self, batch: Vec<Message>) -> Delivery {
        let size = batch.len();

        for (index, msg) in batch.into_iter().enumerate() {
            let message_id = msg.id.clone();
            let deadline = msg.deadline();

            if msg.is_expired() {
                self.abandon(message_id, size - index - 1);
                return Delivery::Expired;
            }

            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline) => {
                    self.abandon(message_id, size - index - 1);
                    return Delivery::Expired;
                }
                sent = self.sender.send(msg) => {
                    if sent.is_err() {
                        self.controller.report_error(WorkerError::ChannelClosed);
                        return Delivery::Closed;
                    }
                    self.metrics.message_delivered();
                }
            }
        }

        Delivery::Complete
    }

    fn abandon(&self, message_id: String, dropped: usize) {
        debug!(message_id = %message_id, dropped, "Abandoning rest of batch");
        self.controller
            .report_error(WorkerError::MessageTimeout { message_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    type Response = Result<Vec<Message>, QueueError>;

    /// Replays scripted responses, then waits for cancellation.
    struct ScriptedReceiver {
        responses: Mutex<VecDeque<Response>>,
        calls: AtomicUsize,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedReceiver {
        fn new(responses: Vec<Response>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                call_times: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Sleep (advancing paused time) until `n` polls happened.
        async fn wait_for_calls(&self, n: usize) {
            while self.calls() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    #[async_trait]
    impl MessageReceiver for ScriptedReceiver {
        async fn receive_messages(&self, cancel: &CancellationToken) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().push(Instant::now());
            let next = self.responses.lock().pop_front();
            match next {
                Some(response) => response,
                None => {
                    cancel.cancelled().await;
                    Err(QueueError::Cancelled)
                }
            }
        }
    }

    fn recording_controller(parent: &CancellationToken) -> (Controller, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let controller = Controller::with_reporter(
            parent,
            WorkerMetrics::new("test"),
            None,
            Arc::new(move |err: &WorkerError| {
                sink.lock().push(err.to_string());
                true
            }),
        );
        (controller, errors)
    }

    fn msg(id: &str, timeout: Duration) -> Message {
        Message::new(id, format!("receipt-{id}"), "body", timeout)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_token_returns_without_polling() {
        let parent = CancellationToken::new();
        parent.cancel();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![Ok(vec![msg("a", Duration::from_secs(30))])]);
        let (tx, mut rx) = mpsc::channel(3);

        Retriever::new(receiver.clone(), controller, tx).run().await;

        assert_eq!(receiver.calls(), 0);
        assert!(errors.lock().is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_aborts_rest_of_batch() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![Ok(vec![
            msg("a", Duration::ZERO),
            msg("b", Duration::from_secs(30)),
            msg("c", Duration::from_secs(30)),
        ])]);
        let (tx, mut rx) = mpsc::channel(3);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());
        // Let the retriever consume the script and park on the next poll.
        receiver.wait_for_calls(2).await;
        parent.cancel();
        handle.await.unwrap();

        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("message a"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_while_channel_full() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![Ok(vec![
            msg("a", Duration::from_secs(5)),
            msg("b", Duration::from_secs(5)),
            msg("c", Duration::from_secs(5)),
        ])]);
        let (tx, mut rx) = mpsc::channel(1);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());
        // Nobody reads: "a" fills the channel, "b" waits until its deadline.
        receiver.wait_for_calls(2).await;
        parent.cancel();
        handle.await.unwrap();

        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("message b"));
        assert_eq!(rx.recv().await.map(|m| m.id), Some("a".to_string()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_delivered_in_order() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let ids = ["a", "b", "c", "d", "e"];
        let receiver = ScriptedReceiver::new(vec![Ok(ids
            .iter()
            .map(|id| msg(id, Duration::from_secs(30)))
            .collect())]);
        let (tx, mut rx) = mpsc::channel(2);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());

        let mut received = Vec::new();
        while received.len() < ids.len() {
            received.push(rx.recv().await.unwrap().id);
        }
        parent.cancel();
        handle.await.unwrap();

        assert_eq!(received, ids);
        assert!(errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_is_reported_and_polling_continues() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![
            Err(QueueError::transport("503 service unavailable")),
            Ok(vec![msg("a", Duration::from_secs(30))]),
        ]);
        let (tx, mut rx) = mpsc::channel(3);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());

        assert_eq!(rx.recv().await.map(|m| m.id), Some("a".to_string()));
        receiver.wait_for_calls(3).await;
        parent.cancel();
        handle.await.unwrap();

        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("unable to receive messages"));
        assert_eq!(receiver.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_shaped_error_without_cancel_is_reported() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![Err(QueueError::Cancelled)]);
        let (tx, _rx) = mpsc::channel(3);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());
        receiver.wait_for_calls(2).await;
        parent.cancel();
        handle.await.unwrap();

        let errors = errors.lock().clone();
        assert_eq!(errors, vec!["unable to receive messages: operation cancelled"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_applied_between_failed_polls() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![
            Err(QueueError::transport("reset")),
            Err(QueueError::transport("reset")),
        ]);
        let (tx, _rx) = mpsc::channel(3);

        let handle = tokio::spawn(
            Retriever::new(receiver.clone(), controller, tx)
                .with_backoff(Backoff::exponential(
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                ))
                .run(),
        );
        receiver.wait_for_calls(3).await;
        parent.cancel();
        handle.await.unwrap();

        // 1s after the first failure, 2s after the second
        let times = receiver.call_times.lock().clone();
        assert_eq!(times[1] - times[0], Duration::from_secs(1));
        assert_eq!(times[2] - times[1], Duration::from_secs(2));
        assert_eq!(errors.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_messages_then_cancel_exits_cleanly() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![Ok(vec![
            msg("a", Duration::from_secs(30)),
            msg("b", Duration::from_secs(30)),
        ])]);
        let (tx, mut rx) = mpsc::channel(3);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());

        assert_eq!(rx.recv().await.map(|m| m.id), Some("a".to_string()));
        assert_eq!(rx.recv().await.map(|m| m.id), Some("b".to_string()));
        parent.cancel();
        handle.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert!(errors.lock().is_empty());
    }

    /// Cancels the pool while the poll is in flight, then still returns a batch.
    struct CancelDuringReceive {
        token: CancellationToken,
        batch: Mutex<Option<Vec<Message>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageReceiver for CancelDuringReceive {
        async fn receive_messages(&self, _cancel: &CancellationToken) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
            Ok(self.batch.lock().take().unwrap_or_default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_received_during_cancellation_is_fully_delivered() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = Arc::new(CancelDuringReceive {
            token: parent.clone(),
            batch: Mutex::new(Some(vec![
                msg("a", Duration::from_secs(30)),
                msg("b", Duration::from_secs(30)),
                msg("c", Duration::from_secs(30)),
            ])),
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::channel(1);

        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());

        let mut received = Vec::new();
        while let Some(msg) = rx.recv().await {
            received.push(msg.id);
        }
        handle.await.unwrap();

        assert_eq!(received, vec!["a", "b", "c"]);
        assert_eq!(receiver.calls.load(Ordering::SeqCst), 1);
        assert!(errors.lock().is_empty());
    }

    /// Returns an empty batch immediately on every poll.
    #[derive(Default)]
    struct NonBlockingReceiver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageReceiver for NonBlockingReceiver {
        async fn receive_messages(&self, _cancel: &CancellationToken) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_empty_polls_yield_to_other_tasks() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = Arc::new(NonBlockingReceiver::default());
        let (tx, _rx) = mpsc::channel(1);

        // Current-thread runtime: this task only runs again if the retriever yields.
        let handle = tokio::spawn(Retriever::new(receiver.clone(), controller, tx).run());
        while receiver.calls.load(Ordering::SeqCst) < 10 {
            tokio::task::yield_now().await;
        }
        parent.cancel();
        handle.await.unwrap();

        assert!(errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_stops_retriever() {
        let parent = CancellationToken::new();
        let (controller, errors) = recording_controller(&parent);
        let receiver = ScriptedReceiver::new(vec![Ok(vec![msg("a", Duration::from_secs(30))])]);
        let (tx, rx) = mpsc::channel(3);
        drop(rx);

        Retriever::new(receiver.clone(), controller, tx).run().await;

        assert_eq!(receiver.calls(), 1);
        assert_eq!(
            errors.lock().clone(),
            vec!["message channel closed, no consumer is running"]
        );
    }
}
