//! Per-replica health model and evaluation
//!
//! A `HealthStatus` is the derived verdict for one `(instance, datacenter)`
//! replica. Evaluation from a probe sample is a pure function; anomaly fields
//! are layered on afterwards by the detector, within the same probe tick, so
//! a published status is always internally consistent.

use serde_derive::{Deserialize, Serialize};

use crate::agent::metrics::MetricsSample;

/// Health verdict for a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Failing,
    Failed,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failing => "failing",
            HealthState::Failed => "failed",
        }
    }
}

/// Mutable health record for one replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub can_serve_traffic: bool,
    pub latency_ms: f64,
    pub memory_used_percent: f64,
    pub hit_rate: f64,
    pub ops_per_second: u64,
    pub connected_clients: u64,
    pub last_check: f64,
    pub consecutive_errors: u32,
    pub consecutive_anomalies: u32,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub error_message: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus {
            status: HealthState::Unknown,
            can_serve_traffic: true,
            latency_ms: 0.0,
            memory_used_percent: 0.0,
            hit_rate: 0.0,
            ops_per_second: 0,
            connected_clients: 0,
            last_check: 0.0,
            consecutive_errors: 0,
            consecutive_anomalies: 0,
            anomaly_score: 0.0,
            is_anomaly: false,
            error_message: None,
        }
    }
}

impl HealthStatus {
    /// Build an error status for a probe that failed to complete.
    ///
    /// `previous` carries over counters so consecutive failures accumulate.
    pub fn from_probe_error(
        previous: Option<&HealthStatus>,
        timestamp: f64,
        error_message: String,
    ) -> HealthStatus {
        let mut status = HealthStatus::default();
        status.status = HealthState::Failed;
        status.can_serve_traffic = false;
        status.last_check = timestamp;
        status.consecutive_errors = previous.map(|p| p.consecutive_errors).unwrap_or(0) + 1;
        status.consecutive_anomalies = previous.map(|p| p.consecutive_anomalies).unwrap_or(0);
        status.error_message = Some(error_message);
        status
    }
}

/// Evaluate a probe sample into a health verdict.
///
/// Rules apply in order and the worst outcome wins:
/// latency above 100 ms degrades, memory above 90% degrades and above 95%
/// fails traffic, any rejected connection degrades. A successful probe always
/// resets `consecutive_errors`.
pub fn evaluate_sample(sample: &MetricsSample) -> HealthStatus {
    let mut status = HealthStatus {
        status: HealthState::Healthy,
        can_serve_traffic: true,
        latency_ms: sample.latency_ms,
        memory_used_percent: sample.memory_used_percent,
        hit_rate: sample.hit_rate,
        ops_per_second: sample.ops_per_second,
        connected_clients: sample.connected_clients,
        last_check: sample.timestamp,
        consecutive_errors: 0,
        consecutive_anomalies: 0,
        anomaly_score: 0.0,
        is_anomaly: false,
        error_message: None,
    };

    if sample.latency_ms > 100.0 {
        status.status = HealthState::Degraded;
    }

    if sample.memory_used_percent > 90.0 {
        status.status = HealthState::Degraded;
        if sample.memory_used_percent > 95.0 {
            status.status = HealthState::Failing;
            status.can_serve_traffic = false;
        }
    }

    if sample.rejected_connections > 0 && status.status == HealthState::Healthy {
        status.status = HealthState::Degraded;
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn sample_with(latency_ms: f64, memory_used_percent: f64, rejected: u64) -> MetricsSample {
        MetricsSample {
            timestamp: 1000.0,
            instance_uid: "cache-01".to_string(),
            instance_name: "session-cache".to_string(),
            datacenter: "dc-a".to_string(),
            latency_ms,
            memory_used_bytes: 0,
            memory_max_bytes: 0,
            memory_used_percent,
            hit_rate: 0.5,
            hits: 1,
            misses: 1,
            ops_per_second: 100,
            connected_clients: 10,
            rejected_connections: rejected,
            evicted_keys: 0,
            expired_keys: 0,
            api_metrics: HashMap::new(),
        }
    }

    #[test]
    fn test_healthy_sample() {
        let status = evaluate_sample(&sample_with(10.0, 40.0, 0));
        assert_eq!(status.status, HealthState::Healthy);
        assert!(status.can_serve_traffic);
        assert_eq!(status.consecutive_errors, 0);
    }

    #[test]
    fn test_latency_threshold_is_strict() {
        assert_eq!(
            evaluate_sample(&sample_with(100.0, 40.0, 0)).status,
            HealthState::Healthy
        );
        assert_eq!(
            evaluate_sample(&sample_with(100.1, 40.0, 0)).status,
            HealthState::Degraded
        );
    }

    #[test]
    fn test_memory_thresholds_are_strict() {
        assert_eq!(
            evaluate_sample(&sample_with(10.0, 90.0, 0)).status,
            HealthState::Healthy
        );
        assert_eq!(
            evaluate_sample(&sample_with(10.0, 90.5, 0)).status,
            HealthState::Degraded
        );

        let at_95 = evaluate_sample(&sample_with(10.0, 95.0, 0));
        assert_eq!(at_95.status, HealthState::Degraded);
        assert!(at_95.can_serve_traffic);

        let above_95 = evaluate_sample(&sample_with(10.0, 95.5, 0));
        assert_eq!(above_95.status, HealthState::Failing);
        assert!(!above_95.can_serve_traffic);
    }

    #[test]
    fn test_rejected_connections_degrade() {
        let status = evaluate_sample(&sample_with(10.0, 40.0, 1));
        assert_eq!(status.status, HealthState::Degraded);
        assert!(status.can_serve_traffic);
    }

    #[test]
    fn test_worst_rule_wins() {
        let status = evaluate_sample(&sample_with(250.0, 97.0, 5));
        assert_eq!(status.status, HealthState::Failing);
        assert!(!status.can_serve_traffic);
    }

    #[test]
    fn test_probe_error_increments_counter() {
        let first = HealthStatus::from_probe_error(None, 10.0, "connection refused".to_string());
        assert_eq!(first.status, HealthState::Failed);
        assert!(!first.can_serve_traffic);
        assert_eq!(first.consecutive_errors, 1);

        let second =
            HealthStatus::from_probe_error(Some(&first), 40.0, "connection refused".to_string());
        assert_eq!(second.consecutive_errors, 2);
    }

    proptest! {
        // The evaluator is a pure function of the sample
        #[test]
        fn prop_evaluator_is_deterministic(
            latency in 0.0f64..2000.0,
            memory in 0.0f64..100.0,
            rejected in 0u64..100,
        ) {
            let sample = sample_with(latency, memory, rejected);
            let a = evaluate_sample(&sample);
            let b = evaluate_sample(&sample);
            prop_assert_eq!(a.status, b.status);
            prop_assert_eq!(a.can_serve_traffic, b.can_serve_traffic);
        }

        // A failed verdict always withdraws traffic
        #[test]
        fn prop_failing_memory_never_serves(memory in 95.01f64..200.0) {
            let status = evaluate_sample(&sample_with(10.0, memory, 0));
            prop_assert!(!status.can_serve_traffic);
            prop_assert_eq!(status.status, HealthState::Failing);
        }
    }
}
