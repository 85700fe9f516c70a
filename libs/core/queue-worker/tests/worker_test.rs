//! End-to-end tests for the worker pool against the in-memory queue

use async_trait::async_trait;
use parking_lot::Mutex;
use queue_worker::{
    BatchHandler, BatchOutcome, BufferConfig, CancellationToken, Consumer, ErrorThreshold,
    HandlerError, MemoryQueue, MemoryQueueConfig, Message, MessageHandler, Worker, WorkerConfig,
    WorkerError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn queue(visibility_timeout: Duration) -> Arc<MemoryQueue> {
    Arc::new(MemoryQueue::new(MemoryQueueConfig {
        max_messages: 10,
        visibility_timeout,
        wait_time: Duration::from_secs(1),
    }))
}

/// Succeeds on every message and cancels `shutdown` once `target` messages were handled.
struct CountingHandler {
    handled: AtomicUsize,
    target: usize,
    shutdown: CancellationToken,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
        if self.handled.fetch_add(1, Ordering::SeqCst) + 1 >= self.target {
            self.shutdown.cancel();
        }
        Ok(())
    }
}

/// Fails every message; cancels `shutdown` after `target` attempts if set.
struct FailingHandler {
    attempts: Arc<AtomicUsize>,
    target: Option<usize>,
    shutdown: CancellationToken,
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.target.is_some_and(|target| attempts >= target) {
            self.shutdown.cancel();
        }
        Err(HandlerError::failed(format!("cannot handle {}", message.body)))
    }
}

#[tokio::test(start_paused = true)]
async fn test_pool_processes_and_deletes_everything() {
    let queue = queue(Duration::from_secs(30));
    for n in 0..25 {
        queue.send(format!("message {n}"));
    }

    let shutdown = CancellationToken::new();
    let handler = CountingHandler {
        handled: AtomicUsize::new(0),
        target: 25,
        shutdown: shutdown.clone(),
    };
    let config = WorkerConfig::new("drain")
        .with_concurrency(3)
        .with_channel_capacity(2);

    Worker::new(Arc::clone(&queue), Consumer::single(handler), config)
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(queue.deleted(), 25);
    assert_eq!(queue.in_flight(), 0);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pool_stops_when_error_threshold_is_reached() {
    let queue = queue(Duration::from_secs(30));
    for n in 0..5 {
        queue.send(format!("message {n}"));
    }

    let shutdown = CancellationToken::new();
    let handler = FailingHandler {
        attempts: Arc::new(AtomicUsize::new(0)),
        target: None,
        shutdown: shutdown.clone(),
    };
    let config = WorkerConfig::new("fragile")
        .with_error_threshold(Some(ErrorThreshold::new(3, Duration::from_secs(60))));

    let result = Worker::new(Arc::clone(&queue), Consumer::single(handler), config)
        .run(shutdown.clone())
        .await;

    assert!(matches!(
        result,
        Err(WorkerError::ErrorThresholdReached { count: 3, .. })
    ));
    // The pool's own token is a child: the caller's token is untouched
    assert!(!shutdown.is_cancelled());
    assert_eq!(queue.deleted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reporter_can_exclude_errors_from_threshold() {
    let queue = queue(Duration::from_secs(30));
    for n in 0..6 {
        queue.send(format!("message {n}"));
    }

    let shutdown = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = FailingHandler {
        attempts: Arc::clone(&attempts),
        target: Some(6),
        shutdown: shutdown.clone(),
    };
    let reported = Arc::new(Mutex::new(Vec::new()));
    let reported_in_reporter = Arc::clone(&reported);

    let config = WorkerConfig::new("lenient")
        .with_error_threshold(Some(ErrorThreshold::new(1, Duration::from_secs(60))));

    Worker::new(Arc::clone(&queue), Consumer::single(handler), config)
        .with_error_reporter(move |err| {
            reported_in_reporter.lock().push(err.kind());
            !matches!(err, WorkerError::Handler { .. })
        })
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 6);
    assert_eq!(reported.lock().len(), 6);
    assert_eq!(queue.deleted(), 0);
    assert_eq!(queue.in_flight(), 6);
}

/// Fails messages whose body starts with `fail`, cancels once `target` messages were seen.
struct SelectiveBatchHandler {
    seen: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    target: usize,
    shutdown: CancellationToken,
}

#[async_trait]
impl BatchHandler for SelectiveBatchHandler {
    async fn handle_batch(&self, messages: &[Message]) -> BatchOutcome {
        self.batches.lock().push(messages.len());
        if self.seen.fetch_add(messages.len(), Ordering::SeqCst) + messages.len() >= self.target {
            self.shutdown.cancel();
        }

        let mut outcome = BatchOutcome::success();
        for msg in messages.iter().filter(|m| m.body.starts_with("fail")) {
            outcome.fail(msg.id.clone(), HandlerError::failed("rejected"));
        }
        outcome
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_pool_deletes_only_successful_messages() {
    let queue = queue(Duration::from_secs(30));
    queue.send("ok 1");
    let rejected = queue.send("fail 2");
    queue.send("ok 3");
    queue.send("ok 4");

    let shutdown = CancellationToken::new();
    let handler = Arc::new(SelectiveBatchHandler {
        seen: AtomicUsize::new(0),
        batches: Mutex::new(Vec::new()),
        target: 4,
        shutdown: shutdown.clone(),
    });
    let consumer = Consumer::Batch {
        handler: handler.clone(),
        buffer: BufferConfig {
            size: 4,
            timeout: Duration::from_millis(100),
        },
    };
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_in_reporter = Arc::clone(&errors);
    let config = WorkerConfig::new("batch")
        .with_channel_capacity(4)
        .with_error_threshold(None);

    Worker::new(Arc::clone(&queue), consumer, config)
        .with_error_reporter(move |err| {
            errors_in_reporter.lock().push(err.to_string());
            true
        })
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(*handler.batches.lock(), vec![4]);
    assert_eq!(queue.deleted(), 3);
    assert_eq!(queue.in_flight(), 1);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(&rejected));
}

/// Overruns the deadline on first delivery, succeeds on redelivery.
struct SlowFirstHandler {
    receive_counts: Mutex<Vec<u32>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl MessageHandler for SlowFirstHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.receive_counts.lock().push(message.receive_count);
        if !message.is_redelivery() {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.shutdown.cancel();
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_handler_past_deadline_is_redelivered() {
    let queue = queue(Duration::from_secs(1));
    queue.send("slow");

    let shutdown = CancellationToken::new();
    let handler = Arc::new(SlowFirstHandler {
        receive_counts: Mutex::new(Vec::new()),
        shutdown: shutdown.clone(),
    });
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_in_reporter = Arc::clone(&errors);
    let config = WorkerConfig::new("slow").with_error_threshold(None);

    Worker::new(Arc::clone(&queue), Consumer::Single(handler.clone()), config)
        .with_error_reporter(move |err| {
            errors_in_reporter.lock().push(err.to_string());
            true
        })
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(*handler.receive_counts.lock(), vec![1, 2]);
    assert_eq!(queue.deleted(), 1);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("exceeded the message deadline"));
}
