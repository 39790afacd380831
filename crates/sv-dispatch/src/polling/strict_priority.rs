use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use sv_common::{pause_duration, Group, QueueConfiguration};

use super::PollingStrategy;

/// Always prefers the highest-weight queue that is not paused.
///
/// Queues of equal weight take turns through a rotating cursor. The cursor
/// goes back to the top whenever a queue returned messages or a paused queue
/// resumed.
pub struct StrictPriority {
    /// Unique names, highest weight first
    queues: Vec<String>,
    paused_until: HashMap<String, Instant>,
    held: HashSet<String>,
    next_queue_index: usize,
    delay: Duration,
    interval: f64,
    last_unpause_check: Option<Instant>,
    group: Group,
}

impl StrictPriority {
    pub fn from_group(group: &Group) -> Self {
        let mut queues = group.unique_queues();
        // Stable sort keeps first-seen order between equal weights
        queues.sort_by(|a, b| group.weight_of(b).cmp(&group.weight_of(a)));

        Self {
            queues,
            paused_until: HashMap::new(),
            held: HashSet::new(),
            next_queue_index: 0,
            delay: group.delay_duration(),
            interval: group.interval.max(0.0),
            last_unpause_check: None,
            group: group.clone(),
        }
    }

    /// Queue names in priority order
    pub fn priority_order(&self) -> &[String] {
        &self.queues
    }

    fn is_paused(&self, queue: &str, now: Instant) -> bool {
        self.held.contains(queue)
            || self
                .paused_until
                .get(queue)
                .map(|until| *until > now)
                .unwrap_or(false)
    }

    /// Drop expired pauses; reset the cursor when any queue resumed since the
    /// previous check. The first check only records its time.
    fn unpause_queues(&mut self, now: Instant) {
        let resumed = self.last_unpause_check.is_some()
            && self.paused_until.values().any(|until| *until <= now);
        self.paused_until.retain(|_, until| *until > now);
        self.last_unpause_check = Some(now);

        if resumed {
            debug!("Paused queue resumed, restarting from the highest priority");
            self.next_queue_index = 0;
        }
    }

    fn pause(&mut self, queue: &str, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let now = Instant::now();
        let until = now.checked_add(duration).unwrap_or(now);
        debug!(queue = %queue, pause_ms = duration.as_millis() as u64, "Pausing queue");
        self.paused_until.insert(queue.to_string(), until);
    }
}

impl PollingStrategy for StrictPriority {
    fn next_queue(&mut self) -> Option<QueueConfiguration> {
        let now = Instant::now();
        self.unpause_queues(now);

        let len = self.queues.len();
        for offset in 0..len {
            let index = (self.next_queue_index + offset) % len;
            if !self.is_paused(&self.queues[index], now) {
                self.next_queue_index = (index + 1) % len;
                return Some(self.group.queue_configuration(&self.queues[index]));
            }
        }
        None
    }

    fn messages_found(&mut self, queue: &str, count: usize) {
        if count == 0 {
            self.pause(queue, self.delay);
        } else if self.interval > 0.0 {
            self.pause(queue, pause_duration(self.interval * count as f64));
        } else {
            self.next_queue_index = 0;
        }
    }

    fn message_processed(&mut self, queue: &str) {
        self.held.remove(queue);
        if let Some(until) = self.paused_until.get_mut(queue) {
            debug!(queue = %queue, "Resuming queue early");
            *until = Instant::now();
        }
    }

    fn hold_until_processed(&mut self, queue: &str) {
        self.held.insert(queue.to_string());
    }

    fn active_queues(&self) -> Vec<(String, usize)> {
        let now = Instant::now();
        let len = self.queues.len();
        self.queues
            .iter()
            .enumerate()
            .map(|(index, queue)| (queue, len - index))
            .filter(|(queue, _)| !self.is_paused(queue, now))
            .map(|(queue, rank)| (queue.clone(), rank))
            .collect()
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(queues: &[(&str, usize)], delay: f64, interval: f64) -> Group {
        let mut group = Group::new("default", 5).with_delay(delay).with_interval(interval);
        for (name, weight) in queues {
            group.add_queue(name, *weight);
        }
        group
    }

    fn next(strategy: &mut StrictPriority) -> Option<String> {
        strategy.next_queue().map(|q| q.name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_from_weights() {
        let sp = StrictPriority::from_group(&group(&[("low", 1), ("med", 2), ("high", 3)], 0.0, 0.0));
        assert_eq!(sp.priority_order(), &["high", "med", "low"]);

        let ties = StrictPriority::from_group(&group(&[("a", 1), ("b", 1), ("c", 2)], 0.0, 0.0));
        assert_eq!(ties.priority_order(), &["c", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_highest_priority_while_it_has_messages() {
        let mut sp = StrictPriority::from_group(&group(&[("low", 1), ("med", 2), ("high", 3)], 5.0, 0.0));
        for _ in 0..5 {
            assert_eq!(next(&mut sp).as_deref(), Some("high"));
            sp.messages_found("high", 3);
        }

        sp.messages_found("high", 0);
        assert_eq!(next(&mut sp).as_deref(), Some("med"));
        sp.messages_found("med", 0);
        assert_eq!(next(&mut sp).as_deref(), Some("low"));
        sp.messages_found("low", 0);
        assert!(sp.next_queue().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_queue_resets_cursor() {
        let mut sp = StrictPriority::from_group(&group(&[("low", 1), ("med", 2), ("high", 3)], 2.0, 0.0));
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
        sp.messages_found("high", 0);
        assert_eq!(next(&mut sp).as_deref(), Some("med"));

        // Without the reset the cursor would point at "low"
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_never_resets_cursor() {
        let mut sp = StrictPriority::from_group(&group(&[("a", 1), ("b", 1)], 1.0, 0.0));
        // Pause expires before anything has ever been checked
        sp.messages_found("a", 0);
        sp.next_queue_index = 1;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(next(&mut sp).as_deref(), Some("b"));
        assert_eq!(next(&mut sp).as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priorities_rotate() {
        let mut sp = StrictPriority::from_group(&group(&[("a", 1), ("b", 1)], 0.0, 0.0));
        assert_eq!(next(&mut sp).as_deref(), Some("a"));
        sp.messages_found("a", 0);
        assert_eq!(next(&mut sp).as_deref(), Some("b"));
        sp.messages_found("b", 0);
        assert_eq!(next(&mut sp).as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_throttles_busy_queue() {
        let mut sp = StrictPriority::from_group(&group(&[("low", 1), ("high", 2)], 0.0, 0.5));
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
        sp.messages_found("high", 4);

        assert_eq!(next(&mut sp).as_deref(), Some("low"));
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(next(&mut sp).as_deref(), Some("low"));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_interval_pauses_for_at_most_a_day() {
        let mut sp = StrictPriority::from_group(&group(&[("low", 1), ("high", 2)], 0.0, 1e300));
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
        sp.messages_found("high", 10);
        assert_eq!(next(&mut sp).as_deref(), Some("low"));

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(next(&mut sp).as_deref(), Some("high"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_queues_keep_rank_numbering() {
        let mut sp = StrictPriority::from_group(&group(&[("low", 1), ("med", 2), ("high", 3)], 5.0, 0.0));
        assert_eq!(
            sp.active_queues(),
            vec![("high".to_string(), 3), ("med".to_string(), 2), ("low".to_string(), 1)]
        );
        sp.messages_found("med", 0);
        assert_eq!(sp.active_queues(), vec![("high".to_string(), 3), ("low".to_string(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_until_processed() {
        let mut sp = StrictPriority::from_group(&group(&[("orders.fifo", 2), ("b", 1)], 0.0, 0.0));
        assert_eq!(next(&mut sp).as_deref(), Some("orders.fifo"));
        sp.hold_until_processed("orders.fifo");
        sp.messages_found("orders.fifo", 1);
        assert_eq!(next(&mut sp).as_deref(), Some("b"));

        sp.message_processed("orders.fifo");
        sp.messages_found("b", 1);
        assert_eq!(next(&mut sp).as_deref(), Some("orders.fifo"));
    }
}
