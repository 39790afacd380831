use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, warn};

use sv_common::MAX_VISIBILITY_TIMEOUT_SECONDS;

use super::{Invocation, Middleware, Next};
use crate::metrics;

/// Turns a failed single-message invocation into a delayed redelivery.
///
/// The delay comes from the worker's `retry_intervals`, picked by the
/// message's receive count. The message is made invisible for that long and
/// the error is swallowed. Batches, workers without intervals and receive
/// counts with no interval rethrow.
///
/// SQS caps a message's total invisibility at 12 hours from receipt, so the
/// requested delay never exceeds `43200 - ceil(elapsed) - 1` seconds.
pub struct ExponentialBackoffRetry;

#[async_trait]
impl Middleware for ExponentialBackoffRetry {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()> {
        let started = Instant::now();
        let err = match next.run(invocation).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let Some(message) = invocation.payload.single() else {
            return Err(err);
        };
        let Some(intervals) = &invocation.worker.options().retry_intervals else {
            return Err(err);
        };
        let receive_count = message.receive_count();
        let Some(interval) = intervals.interval_for(receive_count) else {
            return Err(err);
        };

        let elapsed = started.elapsed().as_secs_f64().ceil() as u32;
        let ceiling = MAX_VISIBILITY_TIMEOUT_SECONDS
            .saturating_sub(elapsed)
            .saturating_sub(1);
        let seconds = u32::try_from(interval).unwrap_or(u32::MAX).min(ceiling);

        let client = invocation.context.client();
        match client
            .change_visibility(&invocation.queue, &message.receipt_handle, seconds)
            .await
        {
            Ok(()) => {
                warn!(
                    worker = %invocation.worker.name(),
                    queue = %invocation.queue,
                    message_id = %message.message_id,
                    receive_count,
                    retry_in_seconds = seconds,
                    error = %format!("{err:#}"),
                    "Message failed, will be retried"
                );
                metrics::record_retry_scheduled(&invocation.queue);
                Ok(())
            }
            Err(e) => {
                error!(
                    queue = %invocation.queue,
                    message_id = %message.message_id,
                    error = %e,
                    "Could not schedule retry"
                );
                Err(err)
            }
        }
    }
}
