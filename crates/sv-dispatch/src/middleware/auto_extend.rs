use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use sv_queue::QueueClient;

use super::{Invocation, Middleware, Next};

/// Seconds before the visibility timeout runs out at which it is extended
pub const EXTEND_UPFRONT_SECONDS: u32 = 5;

/// Keeps a single message invisible while its worker runs by extending the
/// visibility timeout every `visibility_timeout - 5` seconds.
pub struct AutoExtendVisibility;

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn extend_visibility(
    client: Arc<dyn QueueClient>,
    queue: String,
    message_id: String,
    receipt_handle: String,
    visibility_timeout: u32,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match client
            .change_visibility(&queue, &receipt_handle, visibility_timeout)
            .await
        {
            Ok(()) => debug!(queue = %queue, message_id = %message_id, visibility_timeout, "Extended message visibility"),
            Err(e) => warn!(queue = %queue, message_id = %message_id, error = %e, "Could not extend message visibility"),
        }
    }
}

#[async_trait]
impl Middleware for AutoExtendVisibility {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()> {
        if !invocation.worker.options().auto_visibility_timeout {
            return next.run(invocation).await;
        }
        let Some(message) = invocation.payload.single().cloned() else {
            return next.run(invocation).await;
        };

        let visibility_timeout = invocation.queue_attributes().await.visibility_timeout;
        let period = visibility_timeout.saturating_sub(EXTEND_UPFRONT_SECONDS);
        if period == 0 {
            warn!(
                queue = %invocation.queue,
                visibility_timeout,
                "Visibility timeout too short to extend automatically"
            );
            return next.run(invocation).await;
        }

        let _extender = AbortOnDrop(tokio::spawn(extend_visibility(
            invocation.context.client().clone(),
            invocation.queue.clone(),
            message.message_id,
            message.receipt_handle,
            visibility_timeout,
            Duration::from_secs(period as u64),
        )));

        next.run(invocation).await
    }
}
