//! Prometheus metrics for queue workers
//!
//! Provides observability into retrieval, processing and error rates.

use crate::error::ErrorKind;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use strum::{AsRefStr, IntoStaticStr};
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Outcome of processing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessStatus {
    Success,
    Failed,
    DeadlineExceeded,
}

/// Worker metrics helper
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Worker name for labeling
    worker: String,
}

impl WorkerMetrics {
    /// Create new WorkerMetrics
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }

    /// Record a batch returned by the queue
    pub fn batch_received(&self, size: usize) {
        counter!(
            "queue_worker_batches_received_total",
            "worker" => self.worker.clone()
        )
        .increment(1);

        histogram!(
            "queue_worker_batch_size",
            "worker" => self.worker.clone()
        )
        .record(size as f64);
    }

    /// Record a message handed off to a consumer
    pub fn message_delivered(&self) {
        counter!(
            "queue_worker_messages_delivered_total",
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    /// Record the outcome of processing messages
    pub fn messages_processed(&self, status: ProcessStatus, count: usize, duration: Duration) {
        let status: &'static str = status.into();
        counter!(
            "queue_worker_messages_processed_total",
            "worker" => self.worker.clone(),
            "status" => status
        )
        .increment(count as u64);

        histogram!(
            "queue_worker_handler_duration_seconds",
            "worker" => self.worker.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a reported error
    pub fn error(&self, kind: ErrorKind) {
        counter!(
            "queue_worker_errors_total",
            "worker" => self.worker.clone(),
            "kind" => kind.as_ref().to_string()
        )
        .increment(1);
    }
}
