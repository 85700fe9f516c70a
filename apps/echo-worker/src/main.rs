//! Echo Worker Service - Entry Point
//!
//! Demo worker that logs messages from an in-process queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    echo_worker::run().await
}
