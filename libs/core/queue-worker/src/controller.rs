//! Error controller
//!
//! The controller is the single place errors are reported to and the only
//! authority that cancels a pool run. Errors never unwind the retriever or
//! the consumers; they are logged, counted and forwarded to an
//! application-supplied reporter. When an [`ErrorThreshold`] is configured
//! and too many counted errors arrive within one period, the controller
//! cancels the pool.

use crate::error::WorkerError;
use crate::metrics::WorkerMetrics;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Callback receiving every reported error.
///
/// Returns whether the error counts toward the [`ErrorThreshold`].
pub type ErrorReporter = Arc<dyn Fn(&WorkerError) -> bool + Send + Sync>;

/// Shut the pool down after `max_errors` counted errors within `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorThreshold {
    pub max_errors: u32,
    pub period: Duration,
}

impl ErrorThreshold {
    pub fn new(max_errors: u32, period: Duration) -> Self {
        Self { max_errors, period }
    }
}

impl Default for ErrorThreshold {
    fn default() -> Self {
        Self {
            max_errors: 3,
            period: Duration::from_secs(120),
        }
    }
}

struct ErrorWindow {
    started_at: Instant,
    count: u32,
}

struct Inner {
    token: CancellationToken,
    reporter: ErrorReporter,
    threshold: Option<ErrorThreshold>,
    window: Mutex<ErrorWindow>,
    tripped: Mutex<Option<(u32, Duration)>>,
    reported: AtomicU64,
    metrics: WorkerMetrics,
}

/// Central error sink and cancellation authority for one pool run.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Create a controller whose token is a child of `parent`.
    ///
    /// Cancelling `parent` cancels the pool; cancelling the controller does
    /// not cancel `parent`.
    pub fn new(parent: &CancellationToken, metrics: WorkerMetrics) -> Self {
        Self::with_reporter(parent, metrics, None, Arc::new(|_: &WorkerError| true))
    }

    /// Create a controller with an error threshold and a custom reporter.
    pub fn with_reporter(
        parent: &CancellationToken,
        metrics: WorkerMetrics,
        threshold: Option<ErrorThreshold>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: parent.child_token(),
                reporter,
                threshold,
                window: Mutex::new(ErrorWindow {
                    started_at: Instant::now(),
                    count: 0,
                }),
                tripped: Mutex::new(None),
                reported: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// The token every long-running call of this pool observes.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Request shutdown of the pool.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Number of errors reported so far.
    pub fn errors_reported(&self) -> u64 {
        self.inner.reported.load(Ordering::SeqCst)
    }

    /// The error that made the controller shut the pool down, if any.
    pub fn threshold_error(&self) -> Option<WorkerError> {
        let tripped = *self.inner.tripped.lock();
        tripped.map(|(count, period)| WorkerError::ErrorThresholdReached { count, period })
    }

    /// Report an error.
    ///
    /// Never awaits: safe to call from the retriever loop and from any number
    /// of consumer tasks concurrently.
    pub fn report_error(&self, err: WorkerError) {
        self.inner.reported.fetch_add(1, Ordering::SeqCst);
        self.inner.metrics.error(err.kind());
        if err.is_recoverable() {
            warn!(error = %err, kind = %err.kind(), "Worker error reported");
        } else {
            error!(error = %err, kind = %err.kind(), "Unrecoverable worker error reported");
        }

        let counts = (self.inner.reporter)(&err);
        if !counts {
            return;
        }

        let Some(threshold) = self.inner.threshold else {
            return;
        };

        let count = {
            let mut window = self.inner.window.lock();
            if window.started_at.elapsed() >= threshold.period {
                window.started_at = Instant::now();
                window.count = 0;
            }
            window.count += 1;
            window.count
        };

        if count >= threshold.max_errors {
            let mut tripped = self.inner.tripped.lock();
            if tripped.is_none() {
                *tripped = Some((count, threshold.period));
                error!(
                    errors = count,
                    period_secs = threshold.period.as_secs(),
                    "Error threshold reached, shutting down worker"
                );
                self.inner.token.cancel();
            }
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("cancelled", &self.is_cancelled())
            .field("threshold", &self.inner.threshold)
            .field("errors_reported", &self.errors_reported())
            .finish()
    }
}
