use async_trait::async_trait;
use tracing::{debug, warn};

use sv_queue::delete_entries;

use super::{Invocation, Middleware, Next};
use crate::metrics;

/// Deletes the message(s) after a successful perform when the worker has
/// `auto_delete` set.
pub struct AutoDelete;

#[async_trait]
impl Middleware for AutoDelete {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()> {
        next.run(invocation).await?;

        if !invocation.worker.options().auto_delete {
            return Ok(());
        }

        let entries = delete_entries(invocation.payload.messages());
        let count = entries.len();
        let failures = invocation
            .context
            .client()
            .delete_messages(&invocation.queue, entries)
            .await?;

        for failure in &failures {
            warn!(
                queue = %invocation.queue,
                id = %failure.id,
                code = %failure.code,
                message = ?failure.message,
                "Could not delete message"
            );
        }
        debug!(queue = %invocation.queue, deleted = count - failures.len(), "Messages deleted");
        metrics::record_messages_deleted(&invocation.queue, count - failures.len());
        Ok(())
    }
}
