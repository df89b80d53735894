//! In-memory metrics storage
//!
//! Every probe produces an immutable `MetricsSample`. Samples are retained in
//! a bounded per-instance ring together with a parallel ring of feature
//! vectors consumed by the anomaly detector. Both rings evict the oldest
//! entry when full and are safe against concurrent append and read.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Retained probe samples per instance
pub const SAMPLE_RING_CAPACITY: usize = 1000;

/// Retained feature vectors per instance (anomaly training window)
pub const FEATURE_RING_CAPACITY: usize = 10_000;

/// Current wall-clock time as fractional epoch seconds
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One probe measurement of a single replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp: f64,
    pub instance_uid: String,
    pub instance_name: String,
    pub datacenter: String,

    pub latency_ms: f64,
    pub memory_used_bytes: u64,
    pub memory_max_bytes: u64,
    pub memory_used_percent: f64,
    /// hits / (hits + misses), zero when the denominator is zero
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub ops_per_second: u64,
    pub connected_clients: u64,
    pub rejected_connections: u64,
    pub evicted_keys: u64,
    pub expired_keys: u64,

    /// Admin-API statistics, keyed with the `api_` prefix
    #[serde(flatten)]
    pub api_metrics: HashMap<String, f64>,
}

impl MetricsSample {
    pub fn hit_rate(hits: u64, misses: u64) -> f64 {
        if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        }
    }
}

/// Windowed summary for a single metric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricStatistics {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

struct InstanceRings {
    samples: VecDeque<MetricsSample>,
    features: VecDeque<Vec<f64>>,
}

impl InstanceRings {
    fn new() -> Self {
        InstanceRings {
            samples: VecDeque::with_capacity(64),
            features: VecDeque::with_capacity(64),
        }
    }
}

/// Bounded per-instance storage for samples and feature vectors
pub struct MetricsStore {
    rings: Mutex<HashMap<String, InstanceRings>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        MetricsStore {
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Append a sample and its feature vector, evicting the oldest entries
    /// when the rings are full
    pub fn append(&self, sample: MetricsSample, features: Vec<f64>) {
        let mut rings = self.rings.lock();
        let entry = rings
            .entry(sample.instance_uid.clone())
            .or_insert_with(InstanceRings::new);

        entry.samples.push_back(sample);
        if entry.samples.len() > SAMPLE_RING_CAPACITY {
            entry.samples.pop_front();
        }

        entry.features.push_back(features);
        if entry.features.len() > FEATURE_RING_CAPACITY {
            entry.features.pop_front();
        }
    }

    /// The most recent `n` samples, oldest first
    pub fn latest(&self, instance_uid: &str, n: usize) -> Vec<MetricsSample> {
        let rings = self.rings.lock();
        match rings.get(instance_uid) {
            Some(entry) => {
                let skip = entry.samples.len().saturating_sub(n);
                entry.samples.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// All samples within the trailing time window
    pub fn since(&self, instance_uid: &str, minutes: u64) -> Vec<MetricsSample> {
        let cutoff = now_epoch() - (minutes * 60) as f64;
        let rings = self.rings.lock();
        match rings.get(instance_uid) {
            Some(entry) => entry
                .samples
                .iter()
                .filter(|s| s.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn sample_count(&self, instance_uid: &str) -> usize {
        self.rings
            .lock()
            .get(instance_uid)
            .map(|e| e.samples.len())
            .unwrap_or(0)
    }

    /// Snapshot of the feature ring, oldest first
    pub fn features(&self, instance_uid: &str) -> Vec<Vec<f64>> {
        self.rings
            .lock()
            .get(instance_uid)
            .map(|e| e.features.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn feature_count(&self, instance_uid: &str) -> usize {
        self.rings
            .lock()
            .get(instance_uid)
            .map(|e| e.features.len())
            .unwrap_or(0)
    }

    /// Per-dimension mean and standard deviation over the feature ring
    pub fn feature_stats(&self, instance_uid: &str) -> Option<(Vec<f64>, Vec<f64>)> {
        let rings = self.rings.lock();
        let entry = rings.get(instance_uid)?;
        if entry.features.is_empty() {
            return None;
        }

        let dims = entry.features[0].len();
        let count = entry.features.len() as f64;

        let mut means = vec![0.0; dims];
        for row in &entry.features {
            for (i, value) in row.iter().enumerate().take(dims) {
                means[i] += value;
            }
        }
        for mean in &mut means {
            *mean /= count;
        }

        let mut stds = vec![0.0; dims];
        for row in &entry.features {
            for (i, value) in row.iter().enumerate().take(dims) {
                let delta = value - means[i];
                stds[i] += delta * delta;
            }
        }
        for std in &mut stds {
            *std = (*std / count).sqrt();
        }

        Some((means, stds))
    }

    /// Summary statistics for one numeric field over a trailing window
    pub fn statistics<F>(&self, instance_uid: &str, minutes: u64, extract: F) -> MetricStatistics
    where
        F: Fn(&MetricsSample) -> f64,
    {
        let values: Vec<f64> = self
            .since(instance_uid, minutes)
            .iter()
            .map(|s| extract(s))
            .collect();

        if values.is_empty() {
            return MetricStatistics::default();
        }

        let count = values.len();
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for v in &values {
            min = min.min(*v);
            max = max.max(*v);
            sum += v;
        }
        let mean = sum / count as f64;
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;

        MetricStatistics {
            count,
            min,
            max,
            mean,
            std: variance.sqrt(),
        }
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        MetricsStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(uid: &str, dc: &str, timestamp: f64, latency_ms: f64) -> MetricsSample {
        MetricsSample {
            timestamp,
            instance_uid: uid.to_string(),
            instance_name: format!("{}-name", uid),
            datacenter: dc.to_string(),
            latency_ms,
            memory_used_bytes: 1024,
            memory_max_bytes: 4096,
            memory_used_percent: 25.0,
            hit_rate: 0.9,
            hits: 90,
            misses: 10,
            ops_per_second: 1200,
            connected_clients: 40,
            rejected_connections: 0,
            evicted_keys: 0,
            expired_keys: 3,
            api_metrics: HashMap::new(),
        }
    }

    #[test]
    fn test_hit_rate_zero_denominator() {
        assert_eq!(MetricsSample::hit_rate(0, 0), 0.0);
        assert_eq!(MetricsSample::hit_rate(3, 1), 0.75);
    }

    #[test]
    fn test_ring_eviction_keeps_capacity() {
        let store = MetricsStore::new();
        for i in 0..(SAMPLE_RING_CAPACITY + 50) {
            store.append(sample("cache-01", "dc-a", i as f64, 5.0), vec![5.0]);
        }
        assert_eq!(store.sample_count("cache-01"), SAMPLE_RING_CAPACITY);

        // Oldest entries were evicted, newest retained
        let latest = store.latest("cache-01", 1);
        assert_eq!(latest[0].timestamp, (SAMPLE_RING_CAPACITY + 49) as f64);
    }

    #[test]
    fn test_latest_returns_most_recent_in_order() {
        let store = MetricsStore::new();
        for i in 0..10 {
            store.append(sample("cache-01", "dc-a", i as f64, 5.0), vec![5.0]);
        }
        let latest = store.latest("cache-01", 3);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].timestamp, 7.0);
        assert_eq!(latest[2].timestamp, 9.0);
    }

    #[test]
    fn test_since_filters_by_window() {
        let store = MetricsStore::new();
        let now = now_epoch();
        store.append(sample("cache-01", "dc-a", now - 3600.0, 5.0), vec![5.0]);
        store.append(sample("cache-01", "dc-a", now - 60.0, 6.0), vec![6.0]);
        store.append(sample("cache-01", "dc-a", now, 7.0), vec![7.0]);

        let window = store.since("cache-01", 10);
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|s| s.timestamp >= now - 600.0));
    }

    #[test]
    fn test_feature_stats() {
        let store = MetricsStore::new();
        for v in &[1.0, 2.0, 3.0] {
            store.append(sample("cache-01", "dc-a", *v, *v), vec![*v, 10.0]);
        }
        let (means, stds) = store.feature_stats("cache-01").unwrap();
        assert!((means[0] - 2.0).abs() < 1e-9);
        assert!((means[1] - 10.0).abs() < 1e-9);
        assert!(stds[1].abs() < 1e-9);
        assert!(stds[0] > 0.0);
    }

    #[test]
    fn test_sample_roundtrip_preserves_fields() {
        let mut s = sample("cache-01", "dc-a", 1234.5, 42.0);
        s.api_metrics
            .insert("api_avg_latency_ms".to_string(), 1.75);
        let encoded = serde_json::to_string(&s).unwrap();
        let decoded: MetricsSample = serde_json::from_str(&encoded).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn test_unknown_instance_is_empty() {
        let store = MetricsStore::new();
        assert!(store.latest("ghost", 5).is_empty());
        assert!(store.since("ghost", 5).is_empty());
        assert_eq!(store.statistics("ghost", 5, |s| s.latency_ms).count, 0);
    }
}
