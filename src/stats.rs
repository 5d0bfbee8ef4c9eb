//! Streaming per-target statistics.
//!
//! Mean and variance are maintained with Welford's online algorithm so each
//! record stays O(1) in size no matter how many probes it has seen.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::{PingTarget, ProbeOutcome, RunningStatistics};

/// Owns every target's statistics record behind a single lock.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    records: Mutex<HashMap<String, RunningStatistics>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a target. Existing records are left untouched.
    pub fn track(&self, target: &PingTarget) {
        self.records
            .lock()
            .entry(target.id.clone())
            .or_insert_with(|| RunningStatistics::new(target));
    }

    /// Refresh the address/label carried on a record after an update.
    pub fn relabel(&self, target: &PingTarget) {
        if let Some(stats) = self.records.lock().get_mut(&target.id) {
            stats.target = target.address.clone();
            stats.target_label = target.label.clone();
        }
    }

    /// Drop a removed target's record.
    pub fn discard(&self, target_id: &str) {
        self.records.lock().remove(target_id);
    }

    /// Fold one outcome into its target's record.
    ///
    /// Returns false, leaving everything untouched, if the target is not tracked.
    pub fn record(&self, outcome: &ProbeOutcome) -> bool {
        let mut records = self.records.lock();
        let Some(stats) = records.get_mut(&outcome.target_id) else {
            return false;
        };
        apply(stats, outcome);
        true
    }

    pub fn snapshot(&self, target_id: &str) -> Option<RunningStatistics> {
        self.records.lock().get(target_id).cloned()
    }

    pub fn snapshot_all(&self) -> HashMap<String, RunningStatistics> {
        self.records.lock().clone()
    }

    /// Reinitialize one record, or all of them when `target_id` is `None`.
    ///
    /// Returns false if a specific target was requested but is not tracked.
    pub fn reset(&self, target_id: Option<&str>) -> bool {
        let mut records = self.records.lock();
        match target_id {
            Some(id) => match records.get_mut(id) {
                Some(stats) => {
                    reinit(stats);
                    true
                }
                None => false,
            },
            None => {
                records.values_mut().for_each(reinit);
                true
            }
        }
    }
}

fn reinit(stats: &mut RunningStatistics) {
    let target = PingTarget {
        id: stats.target_id.clone(),
        address: stats.target.clone(),
        label: stats.target_label.clone(),
        enabled: true,
    };
    *stats = RunningStatistics::new(&target);
}

fn apply(stats: &mut RunningStatistics, outcome: &ProbeOutcome) {
    stats.total_count += 1;
    stats.last_outcome = Some(outcome.timestamp);

    match outcome.latency_ms().filter(|_| outcome.success) {
        Some(latency) => {
            stats.success_count += 1;
            stats.min_latency_ms = Some(stats.min_latency_ms.map_or(latency, |m| m.min(latency)));
            stats.max_latency_ms = Some(stats.max_latency_ms.map_or(latency, |m| m.max(latency)));

            let n = stats.success_count as f64;
            let mean = stats.mean_latency_ms.unwrap_or(0.0);
            let delta = latency - mean;
            let new_mean = mean + delta / n;
            stats.variance_accumulator += delta * (latency - new_mean);
            stats.mean_latency_ms = Some(new_mean);
        }
        None => stats.failure_count += 1,
    }

    stats.packet_loss_percent = stats.failure_count as f64 / stats.total_count as f64 * 100.0;
    stats.jitter_ms = if stats.success_count >= 2 {
        (stats.variance_accumulator.max(0.0) / (stats.success_count - 1) as f64).sqrt()
    } else {
        0.0
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn ok(target: &PingTarget, ms: f64) -> ProbeOutcome {
        ProbeOutcome::success(target, Utc::now(), Duration::from_secs_f64(ms / 1000.0))
    }

    fn fail(target: &PingTarget) -> ProbeOutcome {
        ProbeOutcome::failure(target, Utc::now(), "timeout".to_string())
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_scenario_counts() {
        let agg = StatsAggregator::new();
        let target = PingTarget::new("1.1.1.1", "Cloudflare");
        agg.track(&target);

        for outcome in [ok(&target, 10.0), ok(&target, 12.0), fail(&target), ok(&target, 11.0), ok(&target, 9.0)] {
            agg.record(&outcome);
        }

        let stats = agg.snapshot(&target.id).unwrap();
        assert_eq!(stats.total_count, 5);
        assert_eq!(stats.success_count, 4);
        assert_eq!(stats.failure_count, 1);
        assert!(close(stats.min_latency_ms.unwrap(), 9.0));
        assert!(close(stats.max_latency_ms.unwrap(), 12.0));
        assert!(close(stats.mean_latency_ms.unwrap(), 10.5));
        assert!(close(stats.packet_loss_percent, 20.0));
    }

    #[test]
    fn test_jitter_is_sample_stddev() {
        let agg = StatsAggregator::new();
        let target = PingTarget::new("1.1.1.1", "");
        agg.track(&target);

        let latencies = [10.0, 20.0, 15.0, 30.0, 25.0];
        for ms in latencies {
            agg.record(&ok(&target, ms));
            agg.record(&fail(&target));
        }

        let mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let var = latencies.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (latencies.len() - 1) as f64;

        let stats = agg.snapshot(&target.id).unwrap();
        assert!(close(stats.jitter_ms, var.sqrt()));
        assert!(close(stats.mean_latency_ms.unwrap(), mean));
    }

    #[test]
    fn test_jitter_degenerate_cases() {
        let agg = StatsAggregator::new();
        let target = PingTarget::new("1.1.1.1", "");
        agg.track(&target);

        let empty = agg.snapshot(&target.id).unwrap();
        assert_eq!(empty.jitter_ms, 0.0);
        assert_eq!(empty.packet_loss_percent, 0.0);
        assert!(empty.min_latency_ms.is_none());

        agg.record(&fail(&target));
        let stats = agg.snapshot(&target.id).unwrap();
        assert_eq!(stats.jitter_ms, 0.0);
        assert!(!stats.jitter_ms.is_nan());
        assert_eq!(stats.packet_loss_percent, 100.0);

        agg.record(&ok(&target, 42.0));
        assert_eq!(agg.snapshot(&target.id).unwrap().jitter_ms, 0.0);
    }

    #[test]
    fn test_counts_stay_consistent() {
        let agg = StatsAggregator::new();
        let target = PingTarget::new("1.1.1.1", "");
        agg.track(&target);

        for i in 0..200u32 {
            if i % 3 == 0 {
                agg.record(&fail(&target));
            } else {
                agg.record(&ok(&target, (i % 17) as f64 + 0.5));
            }
            let stats = agg.snapshot(&target.id).unwrap();
            assert_eq!(stats.total_count, stats.success_count + stats.failure_count);
            assert!((0.0..=100.0).contains(&stats.packet_loss_percent));
            assert!(close(
                stats.packet_loss_percent,
                stats.failure_count as f64 / stats.total_count as f64 * 100.0
            ));
        }
    }

    #[test]
    fn test_untracked_and_discarded_targets() {
        let agg = StatsAggregator::new();
        let target = PingTarget::new("1.1.1.1", "");

        assert!(!agg.record(&ok(&target, 5.0)));
        assert!(agg.snapshot(&target.id).is_none());

        agg.track(&target);
        assert!(agg.record(&ok(&target, 5.0)));
        agg.discard(&target.id);
        assert!(!agg.record(&ok(&target, 5.0)));
        assert!(agg.snapshot_all().is_empty());
    }

    #[test]
    fn test_reset() {
        let agg = StatsAggregator::new();
        let a = PingTarget::new("1.1.1.1", "");
        let b = PingTarget::new("8.8.8.8", "");
        agg.track(&a);
        agg.track(&b);
        agg.record(&ok(&a, 1.0));
        agg.record(&ok(&b, 1.0));

        let before = agg.snapshot(&a.id).unwrap().session_start;
        assert!(agg.reset(Some(&a.id)));
        let after = agg.snapshot(&a.id).unwrap();
        assert_eq!(after.total_count, 0);
        assert!(after.session_start >= before);
        assert_eq!(agg.snapshot(&b.id).unwrap().total_count, 1);

        assert!(!agg.reset(Some("missing")));
        assert!(agg.reset(None));
        assert_eq!(agg.snapshot(&b.id).unwrap().total_count, 0);
        assert_eq!(agg.snapshot_all().len(), 2);
    }
}
