//! Runs one message or batch through the middleware chain

use std::sync::Arc;
use tracing::error;

use sv_common::Payload;

use crate::context::Context;
use crate::events::ErrorContext;
use crate::middleware::Invocation;
use crate::polling::SharedStrategy;
use crate::{metrics, DispatchError, Result};

pub struct Processor {
    ctx: Arc<Context>,
    group: String,
    strategy: SharedStrategy,
}

impl Processor {
    pub fn new(ctx: Arc<Context>, group: impl Into<String>, strategy: SharedStrategy) -> Self {
        Self {
            ctx,
            group: group.into(),
            strategy,
        }
    }

    /// Resolve the worker, parse the body and invoke the middleware chain.
    ///
    /// Every failure leaves the message(s) undeleted for redelivery.
    pub async fn process(&self, queue: &str, payload: Payload, fifo: bool) -> Result<()> {
        let Some(worker) = self.ctx.registry().fetch_worker(queue, &payload) else {
            error!(
                group = %self.group,
                queue = %queue,
                message_ids = %payload.ids(),
                "No worker found for queue, message left for redelivery"
            );
            metrics::record_message_processed(queue, "", "no_worker");
            return Err(DispatchError::WorkerNotFound {
                queue: queue.to_string(),
            });
        };

        let body = match worker.options().body_parser.parse(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    worker = %worker.name(),
                    queue = %queue,
                    message_ids = %payload.ids(),
                    error = %e,
                    "Could not parse message body"
                );
                metrics::record_message_processed(queue, worker.name(), "parse_error");
                return Err(e);
            }
        };

        let worker_name = worker.name().to_string();
        let mut invocation = Invocation {
            worker,
            group: self.group.clone(),
            queue: queue.to_string(),
            payload,
            body,
            fifo,
            context: self.ctx.clone(),
            strategy: self.strategy.clone(),
        };

        match self.ctx.middleware().invoke(&mut invocation).await {
            Ok(()) => {
                metrics::record_message_processed(queue, &worker_name, "success");
                Ok(())
            }
            Err(e) => {
                let message_ids: Vec<String> = invocation
                    .payload
                    .messages()
                    .iter()
                    .map(|m| m.message_id.clone())
                    .collect();
                error!(
                    worker = %worker_name,
                    queue = %queue,
                    message_ids = %message_ids.join(","),
                    error = %format!("{e:#}"),
                    "Processor failed"
                );
                metrics::record_message_processed(queue, &worker_name, "failure");
                self.ctx.handle_error(
                    &e,
                    &ErrorContext {
                        group: self.group.clone(),
                        queue: queue.to_string(),
                        worker: worker_name,
                        message_ids,
                    },
                );
                Err(DispatchError::Worker(e))
            }
        }
    }
}
