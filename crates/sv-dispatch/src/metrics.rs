//! Metrics for the dispatch core
//!
//! Recorded through the `metrics` facade; install any recorder (Prometheus
//! exporter, test recorder) to collect them:
//! - Messages fetched and fetch errors
//! - Processing results and duration
//! - Busy processors per group

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed fetch
pub fn record_messages_fetched(group: &str, queue: &str, count: usize) {
    counter!(
        "sv_messages_fetched_total",
        "group" => group.to_string(),
        "queue" => queue.to_string()
    )
    .increment(count as u64);
}

/// Record a fetch that failed after retries
pub fn record_fetch_error(group: &str, queue: &str) {
    counter!(
        "sv_fetch_errors_total",
        "group" => group.to_string(),
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record the outcome of processing a message or batch
pub fn record_message_processed(queue: &str, worker: &str, result: &str) {
    counter!(
        "sv_messages_processed_total",
        "queue" => queue.to_string(),
        "worker" => worker.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record how long the middleware chain and worker took
pub fn record_processing_duration(queue: &str, worker: &str, duration: Duration, success: bool) {
    histogram!(
        "sv_processing_duration_seconds",
        "queue" => queue.to_string(),
        "worker" => worker.to_string(),
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update busy processors gauge
pub fn set_busy_processors(group: &str, busy: usize) {
    gauge!(
        "sv_busy_processors",
        "group" => group.to_string()
    )
    .set(busy as f64);
}

pub fn record_retry_scheduled(queue: &str) {
    counter!(
        "sv_retries_scheduled_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

pub fn record_messages_deleted(queue: &str, count: usize) {
    counter!(
        "sv_messages_deleted_total",
        "queue" => queue.to_string()
    )
    .increment(count as u64);
}
