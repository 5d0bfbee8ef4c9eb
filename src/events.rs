//! Fan-out of probe outcomes and statistics snapshots to subscribers.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ProbeOutcome, RunningStatistics};

/// Events delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum MonitorEvent {
    ProbeOutcome(ProbeOutcome),
    StatsSnapshot(HashMap<String, RunningStatistics>),
    LogError { message: String },
}

impl MonitorEvent {
    /// Event name as seen on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::ProbeOutcome(_) => "probe-outcome",
            MonitorEvent::StatsSnapshot(_) => "stats-snapshot",
            MonitorEvent::LogError { .. } => "log-error",
        }
    }
}

/// Best-effort broadcaster. Publishing never waits on subscribers; a lagging
/// receiver loses the oldest events instead.
pub struct EventPublisher {
    sender: broadcast::Sender<MonitorEvent>,
    recent: Mutex<RecentOutcomes>,
}

struct RecentOutcomes {
    buf: VecDeque<ProbeOutcome>,
    capacity: usize,
}

impl EventPublisher {
    pub fn new(channel_capacity: usize, history_size: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            recent: Mutex::new(RecentOutcomes {
                buf: VecDeque::with_capacity(history_size),
                capacity: history_size,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn publish_outcome(&self, outcome: &ProbeOutcome) {
        {
            let mut recent = self.recent.lock();
            recent.buf.push_back(outcome.clone());
            recent.trim();
        }
        self.send(MonitorEvent::ProbeOutcome(outcome.clone()));
    }

    pub fn publish_stats(&self, snapshot: HashMap<String, RunningStatistics>) {
        self.send(MonitorEvent::StatsSnapshot(snapshot));
    }

    pub fn publish_log_error(&self, message: String) {
        self.send(MonitorEvent::LogError { message });
    }

    /// Most recent outcomes, newest first.
    pub fn recent(&self, count: Option<usize>) -> Vec<ProbeOutcome> {
        let recent = self.recent.lock();
        let count = count.unwrap_or(recent.buf.len());
        recent.buf.iter().rev().take(count).cloned().collect()
    }

    pub fn set_history_size(&self, capacity: usize) {
        let mut recent = self.recent.lock();
        recent.capacity = capacity;
        recent.trim();
    }

    /// Drop a removed target's history.
    pub fn forget(&self, target_id: &str) {
        self.recent.lock().buf.retain(|o| o.target_id != target_id);
    }

    pub fn clear(&self) {
        self.recent.lock().buf.clear();
    }

    fn send(&self, event: MonitorEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl RecentOutcomes {
    fn trim(&mut self) {
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PingTarget;
    use chrono::Utc;
    use std::time::Duration;

    fn outcome(target: &PingTarget, seq: u64) -> ProbeOutcome {
        let mut o = ProbeOutcome::success(target, Utc::now(), Duration::from_millis(5));
        o.sequence = seq;
        o
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = EventPublisher::new(4, 10);
        let target = PingTarget::new("1.1.1.1", "");
        publisher.publish_outcome(&outcome(&target, 1));
        publisher.publish_stats(HashMap::new());
        assert_eq!(publisher.recent(None).len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let publisher = EventPublisher::new(16, 10);
        let mut rx = publisher.subscribe();
        let target = PingTarget::new("1.1.1.1", "");

        publisher.publish_outcome(&outcome(&target, 1));
        publisher.publish_log_error("disk full".to_string());

        match rx.recv().await.unwrap() {
            MonitorEvent::ProbeOutcome(o) => assert_eq!(o.sequence, 1),
            other => panic!("unexpected event {:?}", other),
        }
        let err = rx.recv().await.unwrap();
        assert_eq!(err.name(), "log-error");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block() {
        let publisher = EventPublisher::new(2, 10);
        let mut rx = publisher.subscribe();
        let target = PingTarget::new("1.1.1.1", "");

        for seq in 1..=10 {
            publisher.publish_outcome(&outcome(&target, seq));
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        match rx.recv().await.unwrap() {
            MonitorEvent::ProbeOutcome(o) => assert_eq!(o.sequence, 9),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_recent_is_bounded_and_newest_first() {
        let publisher = EventPublisher::new(4, 3);
        let a = PingTarget::new("1.1.1.1", "");
        let b = PingTarget::new("8.8.8.8", "");
        for seq in 1..=5 {
            publisher.publish_outcome(&outcome(&a, seq));
        }
        let seqs: Vec<_> = publisher.recent(None).iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![5, 4, 3]);
        assert_eq!(publisher.recent(Some(1)).len(), 1);

        publisher.publish_outcome(&outcome(&b, 1));
        publisher.forget(&a.id);
        assert_eq!(publisher.recent(None).len(), 1);

        publisher.set_history_size(0);
        assert!(publisher.recent(None).is_empty());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(MonitorEvent::LogError {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "log-error");
        assert_eq!(json["payload"]["message"], "boom");
    }
}
