//! Core data model types shared by the engine components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A configured probe target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingTarget {
    pub id: String,
    pub address: String,
    pub label: String,
    pub enabled: bool,
}

impl PingTarget {
    /// Create an enabled target with a fresh id. An empty label falls back to the address.
    pub fn new(address: &str, label: &str) -> Self {
        let label = if label.trim().is_empty() { address } else { label };
        Self {
            id: Uuid::new_v4().to_string(),
            address: address.to_string(),
            label: label.to_string(),
            enabled: true,
        }
    }

    /// Targets installed on first run.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("1.1.1.1", "Cloudflare DNS"),
            Self::new("8.8.8.8", "Google DNS"),
        ]
    }

    /// Quick-add presets offered to the GUI.
    pub fn presets() -> Vec<Self> {
        vec![
            Self::new("1.1.1.1", "Cloudflare DNS"),
            Self::new("8.8.8.8", "Google DNS"),
            Self::new("9.9.9.9", "Quad9 DNS"),
            Self::new("208.67.222.222", "OpenDNS"),
        ]
    }
}

/// Partial update applied by `update_target`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetUpdate {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Result of a single probe.
///
/// `latency` is present iff `success`. `sequence` is 0 until the scheduler's
/// dispatcher assigns the per-target counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub timestamp: DateTime<Utc>,
    pub target_id: String,
    pub target_address: String,
    pub target_label: String,
    #[serde(with = "latency_ms")]
    pub latency: Option<Duration>,
    pub success: bool,
    pub sequence: u64,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn success(target: &PingTarget, timestamp: DateTime<Utc>, latency: Duration) -> Self {
        Self {
            timestamp,
            target_id: target.id.clone(),
            target_address: target.address.clone(),
            target_label: target.label.clone(),
            latency: Some(latency),
            success: true,
            sequence: 0,
            error: None,
        }
    }

    pub fn failure(target: &PingTarget, timestamp: DateTime<Utc>, error: String) -> Self {
        Self {
            timestamp,
            target_id: target.id.clone(),
            target_address: target.address.clone(),
            target_label: target.label.clone(),
            latency: None,
            success: false,
            sequence: 0,
            error: Some(error),
        }
    }

    /// Latency in fractional milliseconds.
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.map(|d| d.as_secs_f64() * 1000.0)
    }

    /// Project onto the on-disk log line.
    pub fn to_log_entry(&self) -> LogEntry {
        LogEntry {
            timestamp: self.timestamp,
            target: self.target_address.clone(),
            target_label: self.target_label.clone(),
            latency_ms: self.latency_ms(),
            success: self.success,
            sequence: self.sequence,
            error: self.error.clone(),
        }
    }
}

/// One line of the JSON log files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub target_label: String,
    pub latency_ms: Option<f64>,
    pub success: bool,
    pub sequence: u64,
    pub error: Option<String>,
}

/// Streaming reliability statistics for one target.
///
/// Latency figures are milliseconds. `variance_accumulator` is Welford's M2
/// (sum of squared deviations from the running mean) over successful probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStatistics {
    pub target_id: String,
    pub target: String,
    pub target_label: String,
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub variance_accumulator: f64,
    pub packet_loss_percent: f64,
    pub jitter_ms: f64,
    pub session_start: DateTime<Utc>,
    pub last_outcome: Option<DateTime<Utc>>,
}

impl RunningStatistics {
    pub fn new(target: &PingTarget) -> Self {
        Self {
            target_id: target.id.clone(),
            target: target.address.clone(),
            target_label: target.label.clone(),
            total_count: 0,
            success_count: 0,
            failure_count: 0,
            min_latency_ms: None,
            max_latency_ms: None,
            mean_latency_ms: None,
            variance_accumulator: 0.0,
            packet_loss_percent: 0.0,
            jitter_ms: 0.0,
            session_start: Utc::now(),
            last_outcome: None,
        }
    }
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Serialize `Option<Duration>` as fractional milliseconds.
mod latency_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_secs_f64() * 1000.0)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<f64>::deserialize(d)?;
        Ok(ms
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| Duration::from_secs_f64(v / 1000.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_label_defaults_to_address() {
        let target = PingTarget::new("example.com", "");
        assert_eq!(target.label, "example.com");
        assert!(target.enabled);
    }

    #[test]
    fn test_log_entry_schema() {
        let target = PingTarget::new("1.1.1.1", "Cloudflare");
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut outcome = ProbeOutcome::success(&target, ts, Duration::from_micros(12_500));
        outcome.sequence = 7;

        let json = serde_json::to_value(outcome.to_log_entry()).unwrap();
        assert_eq!(json["timestamp"], "2024-03-01T10:00:00Z");
        assert_eq!(json["target"], "1.1.1.1");
        assert_eq!(json["target_label"], "Cloudflare");
        assert_eq!(json["latency_ms"], 12.5);
        assert_eq!(json["success"], true);
        assert_eq!(json["sequence"], 7);
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_failure_has_no_latency() {
        let target = PingTarget::new("10.0.0.1", "lan");
        let outcome = ProbeOutcome::failure(&target, Utc::now(), "timeout".to_string());
        let json = serde_json::to_value(outcome.to_log_entry()).unwrap();
        assert!(json["latency_ms"].is_null());
        assert_eq!(json["error"], "timeout");
    }
}
