use async_trait::async_trait;
use tracing::debug;

use super::{Invocation, Middleware, Next};

/// Puts a FIFO queue back into rotation as soon as its message succeeded.
pub struct UnpauseQueue;

#[async_trait]
impl Middleware for UnpauseQueue {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()> {
        next.run(invocation).await?;

        if invocation.fifo {
            debug!(queue = %invocation.queue, "Unpausing FIFO queue");
            invocation.strategy.lock().message_processed(&invocation.queue);
        }
        Ok(())
    }
}
