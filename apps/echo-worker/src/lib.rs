//! Echo Worker Service
//!
//! A demo worker running the queue worker pool against an in-process queue.
//!
//! ## Architecture
//!
//! ```text
//! Seeder (every ECHO_WORKER_SEED_INTERVAL_MS)
//!   ↓
//! MemoryQueue (visibility timeout, long polling)
//!   ↓
//! Retriever → bounded channel → EchoHandler × QUEUE_WORKER_CONCURRENCY
//! ```
//!
//! Messages whose body starts with `fail` are rejected by the handler and
//! come back once their visibility timeout runs out, which makes the error
//! threshold easy to watch in action.

use async_trait::async_trait;
use core_config::{Environment, FromEnv, env_parse};
use eyre::{Result, WrapErr};
use queue_worker::{
    CancellationToken, Consumer, HandlerError, MemoryQueue, MemoryQueueConfig, Message,
    MessageHandler, Worker, WorkerConfig, WorkerError, metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};

/// Logs every message body.
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        if message.body.starts_with("fail") {
            return Err(HandlerError::failed(format!(
                "refusing to echo '{}'",
                message.body
            )));
        }

        info!(
            message_id = %message.id,
            receive_count = message.receive_count,
            body = %message.body,
            "Echo"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EchoHandler"
    }
}

/// Settings for the demo message seeder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedConfig {
    /// Messages to enqueue before stopping
    pub messages: u32,
    /// Pause between two messages
    pub interval: Duration,
    /// Every n-th message is a failing one (0 = none)
    pub fail_every: u32,
}

impl FromEnv for SeedConfig {
    fn from_env() -> std::result::Result<Self, core_config::ConfigError> {
        Ok(Self {
            messages: env_parse("ECHO_WORKER_SEED_MESSAGES", 20)?,
            interval: Duration::from_millis(env_parse("ECHO_WORKER_SEED_INTERVAL_MS", 500)?),
            fail_every: env_parse("ECHO_WORKER_FAIL_EVERY", 0)?,
        })
    }
}

/// Enqueue the demo messages, stopping early on shutdown.
pub async fn seed(queue: Arc<MemoryQueue>, config: SeedConfig, shutdown: CancellationToken) {
    for n in 1..=config.messages {
        let body = if config.fail_every > 0 && n % config.fail_every == 0 {
            format!("fail #{n}")
        } else {
            format!("hello #{n}")
        };
        let id = queue.send(body);
        debug!(message_id = %id, "Seeded message");

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
    info!(messages = config.messages, "Seeding finished");
}

/// Run the echo worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads the pool configuration from `QUEUE_WORKER_*` variables
/// 3. Seeds an in-process queue in the background
/// 4. Runs the pool until SIGINT/SIGTERM or the error threshold
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the pool stopped
/// because of too many errors.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to initialize metrics")?;

    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let seed_config = SeedConfig::from_env().wrap_err("Failed to load seed configuration")?;
    info!(
        worker = %worker_config.name,
        concurrency = worker_config.concurrency,
        channel_capacity = worker_config.channel_capacity,
        seed_messages = seed_config.messages,
        "Worker configuration loaded"
    );

    let queue = Arc::new(MemoryQueue::new(MemoryQueueConfig {
        max_messages: 10,
        visibility_timeout: Duration::from_secs(5),
        wait_time: Duration::from_secs(2),
    }));

    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        signal_token.cancel();
    });

    tokio::spawn(seed(Arc::clone(&queue), seed_config, shutdown.clone()));

    let worker = Worker::new(Arc::clone(&queue), Consumer::single(EchoHandler), worker_config)
        .with_error_reporter(|err| !matches!(err, WorkerError::MessageTimeout { .. }));

    let result = worker.run(shutdown.clone()).await;
    shutdown.cancel();

    debug!(metrics = %metrics::render_metrics(), "Final metrics");
    info!(
        deleted = queue.deleted(),
        pending = queue.len(),
        in_flight = queue.in_flight(),
        "Echo worker stopped"
    );

    result.wrap_err("Queue worker stopped with an error")
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
