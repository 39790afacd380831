use async_trait::async_trait;
use tracing::{error, warn};

use sv_queue::delete_entries;

use super::{Invocation, Middleware, Next};
use crate::metrics;

/// Deletes the message(s) when perform fails with an error the worker
/// declared non-retryable, and swallows the error.
pub struct NonRetryableError;

#[async_trait]
impl Middleware for NonRetryableError {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()> {
        let err = match next.run(invocation).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let matches = invocation
            .worker
            .options()
            .non_retryable
            .as_ref()
            .map(|rule| rule.matches(&err))
            .unwrap_or(false);
        if !matches {
            return Err(err);
        }

        let entries = delete_entries(invocation.payload.messages());
        let count = entries.len();
        match invocation
            .context
            .client()
            .delete_messages(&invocation.queue, entries)
            .await
        {
            Ok(failures) => {
                for failure in &failures {
                    warn!(queue = %invocation.queue, id = %failure.id, code = %failure.code, "Could not delete message");
                }
                warn!(
                    worker = %invocation.worker.name(),
                    queue = %invocation.queue,
                    message_ids = %invocation.payload.ids(),
                    error = %format!("{err:#}"),
                    "Non-retryable error, message deleted"
                );
                metrics::record_messages_deleted(&invocation.queue, count - failures.len());
                Ok(())
            }
            Err(e) => {
                error!(queue = %invocation.queue, error = %e, "Could not delete message after non-retryable error");
                Err(err)
            }
        }
    }
}
