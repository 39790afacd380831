use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{Invocation, Middleware, Next};
use crate::metrics;

/// Logs start, completion and failure of each invocation and warns when
/// processing outlived the queue's visibility timeout.
pub struct Timing;

#[async_trait]
impl Middleware for Timing {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()> {
        let worker = invocation.worker.name().to_string();
        let message_ids = invocation.payload.ids();
        let started = Instant::now();
        info!(worker = %worker, queue = %invocation.queue, message_ids = %message_ids, "Started");

        let result = next.run(invocation).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        metrics::record_processing_duration(&invocation.queue, &worker, elapsed, result.is_ok());

        // Visibility timeouts are whole seconds; shorter runs only outlive a zero timeout
        if elapsed >= Duration::from_secs(1) {
            let visibility_timeout = invocation.queue_attributes().await.visibility_timeout;
            if elapsed > Duration::from_secs(visibility_timeout as u64) {
                warn!(
                    worker = %worker,
                    queue = %invocation.queue,
                    message_ids = %message_ids,
                    elapsed_ms,
                    visibility_timeout,
                    "Exceeded the queue visibility timeout, the message may have been processed more than once"
                );
            }
        }

        match &result {
            Ok(()) => info!(worker = %worker, queue = %invocation.queue, message_ids = %message_ids, elapsed_ms, "Completed"),
            Err(e) => info!(
                worker = %worker,
                queue = %invocation.queue,
                message_ids = %message_ids,
                elapsed_ms,
                error = %e,
                "Failed"
            ),
        }
        result
    }
}
