use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use sv_common::{Group, QueueConfiguration};

use super::PollingStrategy;

/// Round robin over a list where each queue appears `weight` times.
///
/// An empty fetch removes one occurrence of the queue for `delay`; a
/// non-empty fetch adds one occurrence back, up to the configured weight.
pub struct WeightedRoundRobin {
    queues: Vec<String>,
    initial_queues: Vec<String>,
    /// Ordered by resume time
    paused_queues: VecDeque<(Instant, String)>,
    held: Vec<String>,
    delay: Duration,
    group: Group,
}

impl WeightedRoundRobin {
    pub fn new(queues: Vec<String>, delay: Duration) -> Self {
        let mut group = Group::new("", 1);
        group.queues = queues.clone();
        Self::with_group(queues, delay, group)
    }

    pub fn from_group(group: &Group) -> Self {
        Self::with_group(group.queues.clone(), group.delay_duration(), group.clone())
    }

    fn with_group(queues: Vec<String>, delay: Duration, group: Group) -> Self {
        Self {
            initial_queues: queues.clone(),
            queues,
            paused_queues: VecDeque::new(),
            held: Vec::new(),
            delay,
            group,
        }
    }

    fn occurrences(list: &[String], queue: &str) -> usize {
        list.iter().filter(|q| q.as_str() == queue).count()
    }

    fn is_held(&self, queue: &str) -> bool {
        self.held.iter().any(|q| q == queue)
    }

    fn pause(&mut self, queue: &str, until: Instant) {
        let position = self
            .paused_queues
            .iter()
            .position(|(resume_at, _)| *resume_at > until)
            .unwrap_or(self.paused_queues.len());
        self.paused_queues.insert(position, (until, queue.to_string()));
    }

    fn unpause_queues(&mut self) {
        let now = Instant::now();
        while let Some((resume_at, _)) = self.paused_queues.front() {
            if *resume_at > now {
                break;
            }
            if let Some((_, queue)) = self.paused_queues.pop_front() {
                let below_weight = Self::occurrences(&self.queues, &queue)
                    < Self::occurrences(&self.initial_queues, &queue);
                if below_weight && !self.is_held(&queue) {
                    debug!(queue = %queue, "Unpausing queue");
                    self.queues.push(queue);
                }
            }
        }
    }
}

impl PollingStrategy for WeightedRoundRobin {
    fn next_queue(&mut self) -> Option<QueueConfiguration> {
        self.unpause_queues();
        if self.queues.is_empty() {
            return None;
        }
        let queue = self.queues.remove(0);
        self.queues.push(queue.clone());
        Some(self.group.queue_configuration(&queue))
    }

    fn messages_found(&mut self, queue: &str, count: usize) {
        if count == 0 {
            if self.delay.is_zero() {
                return;
            }
            if let Some(position) = self.queues.iter().position(|q| q == queue) {
                self.queues.remove(position);
                let now = Instant::now();
                let until = now.checked_add(self.delay).unwrap_or(now);
                debug!(queue = %queue, delay_ms = self.delay.as_millis() as u64, "Pausing queue");
                self.pause(queue, until);
            }
            return;
        }

        if self.is_held(queue) {
            return;
        }
        let maximum = Self::occurrences(&self.initial_queues, queue);
        let current = Self::occurrences(&self.queues, queue);
        if current < maximum {
            debug!(queue = %queue, weight = current + 1, max = maximum, "Increasing queue weight");
            // The recovered occurrence no longer waits in the paused list
            if let Some(index) = self.paused_queues.iter().position(|(_, q)| q == queue) {
                self.paused_queues.remove(index);
            }
            self.queues.push(queue.to_string());
        }
    }

    fn message_processed(&mut self, queue: &str) {
        if let Some(position) = self.held.iter().position(|q| q == queue) {
            self.held.remove(position);
            debug!(queue = %queue, "Releasing held queue");
            let weight = Self::occurrences(&self.initial_queues, queue).max(1);
            for _ in 0..weight {
                self.queues.push(queue.to_string());
            }
            return;
        }

        let paused: Vec<usize> = self
            .paused_queues
            .iter()
            .enumerate()
            .filter(|(_, (_, q))| q == queue)
            .map(|(i, _)| i)
            .collect();
        if !paused.is_empty() {
            let now = Instant::now();
            for index in paused.into_iter().rev() {
                self.paused_queues.remove(index);
            }
            self.pause(queue, now);
        }
    }

    fn hold_until_processed(&mut self, queue: &str) {
        self.queues.retain(|q| q != queue);
        self.paused_queues.retain(|(_, q)| q != queue);
        if !self.is_held(queue) {
            self.held.push(queue.to_string());
        }
    }

    fn active_queues(&self) -> Vec<(String, usize)> {
        let mut active: Vec<(String, usize)> = Vec::new();
        for queue in &self.queues {
            match active.iter_mut().find(|(name, _)| name == queue) {
                Some((_, weight)) => *weight += 1,
                None => active.push((queue.clone(), 1)),
            }
        }
        active
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}
