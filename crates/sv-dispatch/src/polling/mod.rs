//! Polling strategies decide which queue a group fetches from next.
//!
//! Both strategies pause queues that came back empty and resume them after
//! the group's delay. FIFO queues are additionally held out of rotation while
//! one of their messages is being processed.

mod strict_priority;
mod weighted_round_robin;

pub use strict_priority::StrictPriority;
pub use weighted_round_robin::WeightedRoundRobin;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use sv_common::{Group, PollingStrategyKind, QueueConfiguration};

pub trait PollingStrategy: Send {
    /// Resume expired pauses, then pick the next queue to fetch from.
    fn next_queue(&mut self) -> Option<QueueConfiguration>;

    /// Report how many messages a fetch from `queue` returned.
    fn messages_found(&mut self, queue: &str, count: usize);

    /// A message from `queue` finished processing; release a FIFO hold and
    /// resume any pause early.
    fn message_processed(&mut self, queue: &str);

    /// Take `queue` out of rotation until `message_processed(queue)`.
    fn hold_until_processed(&mut self, queue: &str);

    /// `(queue, weight)` for WeightedRoundRobin, `(queue, rank)` for
    /// StrictPriority; paused and held queues are left out.
    fn active_queues(&self) -> Vec<(String, usize)>;

    fn delay(&self) -> Duration;
}

/// Strategy state shared by a group's dispatch loop and its processors.
/// The lock is only held for synchronous strategy calls.
pub type SharedStrategy = Arc<Mutex<Box<dyn PollingStrategy>>>;

pub fn build_strategy(group: &Group) -> Box<dyn PollingStrategy> {
    match group.polling_strategy {
        PollingStrategyKind::WeightedRoundRobin => Box::new(WeightedRoundRobin::from_group(group)),
        PollingStrategyKind::StrictPriority => Box::new(StrictPriority::from_group(group)),
    }
}

pub fn shared_strategy(group: &Group) -> SharedStrategy {
    Arc::new(Mutex::new(build_strategy(group)))
}
