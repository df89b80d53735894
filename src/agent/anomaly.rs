//! Statistical anomaly detection over probe metrics
//!
//! Each instance gets its own isolation forest trained on a fixed feature
//! vector extracted from probe samples, with a standard scaler fitted over
//! the feature ring. Scores are normalized to [0, 1] where 1 is most
//! anomalous. Models train asynchronously and persist to disk so restarts
//! resume with a trained detector.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::agent::alerting::{AlertSink, Severity};
use crate::agent::config::Instance;
use crate::agent::health::{HealthState, HealthStatus};
use crate::agent::metrics::{now_epoch, MetricsSample, MetricsStore};

#[derive(Debug, Display, From, Error)]
pub enum ModelError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    #[display(fmt = "unsupported model version {}", _0)]
    UnsupportedVersion(#[error(not(source))] u32),
}

type Result<T> = std::result::Result<T, ModelError>;

/// Artifact format version written to disk
const MODEL_VERSION: u32 = 1;

/// Minimum feature-ring size before training and scoring are enabled
pub const MIN_TRAINING_SAMPLES: usize = 100;

/// Feature order used by the model; contributor reports use these names
pub const FEATURE_NAMES: [&str; 8] = [
    "latency_ms",
    "memory_used_percent",
    "hit_rate",
    "ops_per_second",
    "connected_clients",
    "rejected_connections",
    "evicted_keys",
    "api_avg_latency_ms",
];

/// Extract the model feature vector from a probe sample
pub fn extract_features(sample: &MetricsSample) -> Vec<f64> {
    vec![
        sample.latency_ms,
        sample.memory_used_percent,
        sample.hit_rate,
        (sample.ops_per_second as f64 / 10_000.0).min(1.0),
        (sample.connected_clients as f64 / 1000.0).min(1.0),
        sample.rejected_connections as f64,
        sample.evicted_keys as f64,
        sample
            .api_metrics
            .get("api_avg_latency_ms")
            .copied()
            .unwrap_or(0.0),
    ]
}

/// Per-feature standardization fitted over the training window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    version: u32,
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl StandardScaler {
    fn fit(data: &[Vec<f64>]) -> StandardScaler {
        let dims = data.first().map(|row| row.len()).unwrap_or(0);
        let count = data.len().max(1) as f64;

        let mut mean = vec![0.0; dims];
        for row in data {
            for (i, v) in row.iter().enumerate() {
                mean[i] += v;
            }
        }
        for m in &mut mean {
            *m /= count;
        }

        let mut std = vec![0.0; dims];
        for row in data {
            for (i, v) in row.iter().enumerate() {
                let delta = v - mean[i];
                std[i] += delta * delta;
            }
        }
        for s in &mut std {
            *s = (*s / count).sqrt();
        }

        StandardScaler {
            version: MODEL_VERSION,
            mean,
            std,
        }
    }

    fn transform(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mean = self.mean.get(i).copied().unwrap_or(0.0);
                let std = self.std.get(i).copied().unwrap_or(0.0);
                if std <= f64::EPSILON {
                    0.0
                } else {
                    (v - mean) / std
                }
            })
            .collect()
    }
}

/// One node of an isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
    Leaf {
        size: usize,
    },
}

/// Expected path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    // H(n-1) approximated with Euler's constant
    2.0 * ((n - 1.0).ln() + 0.577_215_664_9) - 2.0 * (n - 1.0) / n
}

fn build_tree(
    data: &[Vec<f64>],
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> TreeNode {
    if indices.len() <= 1 || depth >= max_depth {
        return TreeNode::Leaf {
            size: indices.len(),
        };
    }

    let dims = data[indices[0]].len();

    // Features with spread in this partition
    let mut candidates = Vec::new();
    for feature in 0..dims {
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for &i in indices {
            min = min.min(data[i][feature]);
            max = max.max(data[i][feature]);
        }
        if max > min {
            candidates.push((feature, min, max));
        }
    }
    if candidates.is_empty() {
        return TreeNode::Leaf {
            size: indices.len(),
        };
    }

    let (feature, min, max) = candidates[rng.gen_range(0, candidates.len())];
    let threshold = rng.gen_range(min, max);

    let (left, right): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .copied()
        .partition(|&i| data[i][feature] < threshold);

    TreeNode::Split {
        feature,
        threshold,
        left: Box::new(build_tree(data, &left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(data, &right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &TreeNode, features: &[f64], depth: usize) -> f64 {
    match node {
        TreeNode::Leaf { size } => depth as f64 + average_path_length(*size),
        TreeNode::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            let value = features.get(*feature).copied().unwrap_or(0.0);
            if value < *threshold {
                path_length(left, features, depth + 1)
            } else {
                path_length(right, features, depth + 1)
            }
        }
    }
}

/// Isolation forest outlier model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    version: u32,
    n_estimators: usize,
    max_samples: usize,
    contamination: f64,
    trees: Vec<TreeNode>,
}

impl IsolationForest {
    /// Fit a forest on scaled feature rows
    pub fn fit(data: &[Vec<f64>], seed: u64) -> IsolationForest {
        let n = data.len();
        let max_samples = n.min(256);
        let max_depth = (max_samples as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..100)
            .map(|_| {
                let indices = rand::seq::index::sample(&mut rng, n, max_samples).into_vec();
                build_tree(data, &indices, 0, max_depth, &mut rng)
            })
            .collect();

        IsolationForest {
            version: MODEL_VERSION,
            n_estimators: 100,
            max_samples,
            contamination: 0.05,
            trees,
        }
    }

    /// Anomaly score in [0, 1]; values near 1 isolate quickly and are
    /// the most anomalous
    pub fn score(&self, features: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let expected: f64 = self
            .trees
            .iter()
            .map(|t| path_length(t, features, 0))
            .sum::<f64>()
            / self.trees.len() as f64;

        let c = average_path_length(self.max_samples);
        if c <= 0.0 {
            return 0.0;
        }
        2f64.powf(-expected / c)
    }
}

/// Trained state for one instance
struct AnomalyModel {
    forest: Option<IsolationForest>,
    scaler: Option<StandardScaler>,
    is_trained: bool,
    last_training: f64,
}

impl AnomalyModel {
    fn untrained() -> AnomalyModel {
        AnomalyModel {
            forest: None,
            scaler: None,
            is_trained: false,
            last_training: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ForestArtifact {
    version: u32,
    trained_at: f64,
    forest: IsolationForest,
}

/// The outcome of scoring one sample
#[derive(Debug, Clone, Default)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    pub score: f64,
    /// Feature name -> normalized z-score contribution
    pub contributors: HashMap<String, f64>,
}

/// Per-instance anomaly detection with asynchronous training
pub struct AnomalyDetector {
    model_path: PathBuf,
    threshold: f64,
    instances: Vec<Instance>,
    store: Arc<MetricsStore>,
    alerts: Arc<dyn AlertSink>,
    models: Mutex<HashMap<String, AnomalyModel>>,
}

impl AnomalyDetector {
    pub fn new(
        model_path: &str,
        threshold: f64,
        instances: Vec<Instance>,
        store: Arc<MetricsStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> AnomalyDetector {
        AnomalyDetector {
            model_path: PathBuf::from(model_path),
            threshold,
            instances,
            store,
            alerts,
            models: Mutex::new(HashMap::new()),
        }
    }

    fn model_file(&self, uid: &str) -> PathBuf {
        self.model_path.join(format!("{}_model.json", uid))
    }

    fn scaler_file(&self, uid: &str) -> PathBuf {
        self.model_path.join(format!("{}_scaler.json", uid))
    }

    /// Create the model directory and load any persisted artifacts
    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.model_path)?;

        let mut models = self.models.lock();
        for instance in &self.instances {
            let model = match self.load_artifacts(&instance.uid) {
                Ok(Some(model)) => {
                    info!("loaded anomaly model for instance {}", instance.name);
                    model
                }
                Ok(None) => AnomalyModel::untrained(),
                Err(e) => {
                    error!(
                        "failed to load anomaly model for {}: {}, starting untrained",
                        instance.name, e
                    );
                    AnomalyModel::untrained()
                }
            };
            models.insert(instance.uid.clone(), model);
        }
        Ok(())
    }

    fn load_artifacts(&self, uid: &str) -> Result<Option<AnomalyModel>> {
        let model_file = self.model_file(uid);
        let scaler_file = self.scaler_file(uid);
        if !model_file.exists() || !scaler_file.exists() {
            return Ok(None);
        }

        let artifact: ForestArtifact = serde_json::from_str(&fs::read_to_string(&model_file)?)?;
        if artifact.version != MODEL_VERSION {
            return Err(ModelError::UnsupportedVersion(artifact.version));
        }
        let scaler: StandardScaler = serde_json::from_str(&fs::read_to_string(&scaler_file)?)?;
        if scaler.version != MODEL_VERSION {
            return Err(ModelError::UnsupportedVersion(scaler.version));
        }

        Ok(Some(AnomalyModel {
            forest: Some(artifact.forest),
            scaler: Some(scaler),
            is_trained: true,
            last_training: artifact.trained_at,
        }))
    }

    /// Re-fit the model for one instance from its feature ring
    pub fn train_instance(&self, uid: &str, name: &str) {
        let features = self.store.features(uid);
        if features.len() < MIN_TRAINING_SAMPLES {
            debug!(
                "not enough data to train model for {} ({} samples)",
                name,
                features.len()
            );
            return;
        }

        let scaler = StandardScaler::fit(&features);
        let scaled: Vec<Vec<f64>> = features.iter().map(|row| scaler.transform(row)).collect();
        let forest = IsolationForest::fit(&scaled, 42);

        let mut models = self.models.lock();
        let model = models
            .entry(uid.to_string())
            .or_insert_with(AnomalyModel::untrained);
        model.forest = Some(forest);
        model.scaler = Some(scaler);
        model.is_trained = true;
        model.last_training = now_epoch();

        info!(
            "trained anomaly model for {} with {} samples",
            name,
            features.len()
        );
    }

    pub fn train_all(&self) {
        for instance in &self.instances {
            self.train_instance(&instance.uid, &instance.name);
        }
    }

    /// Persist every trained model and scaler to disk
    pub fn save_models(&self) {
        let models = self.models.lock();
        for (uid, model) in models.iter() {
            if !model.is_trained {
                continue;
            }
            let (forest, scaler) = match (&model.forest, &model.scaler) {
                (Some(f), Some(s)) => (f, s),
                _ => continue,
            };
            let artifact = ForestArtifact {
                version: MODEL_VERSION,
                trained_at: model.last_training,
                forest: forest.clone(),
            };
            if let Err(e) = self.write_artifacts(uid, &artifact, scaler) {
                error!("failed to save anomaly model for {}: {}", uid, e);
            } else {
                info!("saved anomaly model for instance {}", uid);
            }
        }
    }

    fn write_artifacts(
        &self,
        uid: &str,
        artifact: &ForestArtifact,
        scaler: &StandardScaler,
    ) -> Result<()> {
        fs::write(self.model_file(uid), serde_json::to_string(artifact)?)?;
        fs::write(self.scaler_file(uid), serde_json::to_string(scaler)?)?;
        Ok(())
    }

    pub fn is_trained(&self, uid: &str) -> bool {
        self.models
            .lock()
            .get(uid)
            .map(|m| m.is_trained)
            .unwrap_or(false)
    }

    /// Score a feature vector; `None` while warming up or untrained
    pub fn score(&self, uid: &str, features: &[f64]) -> Option<f64> {
        if self.store.feature_count(uid) < MIN_TRAINING_SAMPLES {
            return None;
        }
        let models = self.models.lock();
        let model = models.get(uid)?;
        if !model.is_trained {
            return None;
        }
        let scaled = model.scaler.as_ref()?.transform(features);
        Some(model.forest.as_ref()?.score(&scaled))
    }

    /// Features that push this sample away from the learned baseline
    fn contributing_features(&self, uid: &str, features: &[f64]) -> HashMap<String, f64> {
        let mut contributors = HashMap::new();
        let (means, stds) = match self.store.feature_stats(uid) {
            Some(stats) => stats,
            None => return contributors,
        };

        for (i, name) in FEATURE_NAMES.iter().enumerate() {
            let (value, mean, std) = match (features.get(i), means.get(i), stds.get(i)) {
                (Some(v), Some(m), Some(s)) => (*v, *m, *s),
                _ => continue,
            };
            if std <= f64::EPSILON {
                continue;
            }
            let z_score = ((value - mean) / std).abs();
            if z_score > 2.0 {
                contributors.insert(name.to_string(), (z_score / 5.0).min(1.0));
            }
        }
        contributors
    }

    /// Score a sample and fold the verdict into the pending health status.
    ///
    /// Runs inside the probe tick, before the status is published, so anomaly
    /// fields are never overwritten by a later probe of the same replica.
    pub async fn process_sample(
        &self,
        previous: Option<&HealthStatus>,
        status: &mut HealthStatus,
        sample: &MetricsSample,
        features: &[f64],
    ) -> AnomalyVerdict {
        let score = match self.score(&sample.instance_uid, features) {
            Some(score) => score,
            None => return AnomalyVerdict::default(),
        };

        status.anomaly_score = score;

        if score <= self.threshold {
            status.is_anomaly = false;
            status.consecutive_anomalies = 0;
            return AnomalyVerdict {
                is_anomaly: false,
                score,
                contributors: HashMap::new(),
            };
        }

        status.is_anomaly = true;
        status.consecutive_anomalies =
            previous.map(|p| p.consecutive_anomalies).unwrap_or(0) + 1;

        apply_severity(status, score);

        warn!(
            "anomaly detected for {} in {} (score: {:.2})",
            sample.instance_uid, sample.datacenter, score
        );

        let contributors = self.contributing_features(&sample.instance_uid, features);

        if status.consecutive_anomalies >= 3 {
            self.send_anomaly_alert(sample, score, &contributors).await;
        }

        AnomalyVerdict {
            is_anomaly: true,
            score,
            contributors,
        }
    }

    async fn send_anomaly_alert(
        &self,
        sample: &MetricsSample,
        score: f64,
        contributors: &HashMap<String, f64>,
    ) {
        let severity = if score > 0.95 {
            Severity::Critical
        } else if score > 0.9 {
            Severity::Error
        } else {
            Severity::Warning
        };

        let details = json!({
            "instance_uid": sample.instance_uid,
            "instance_name": sample.instance_name,
            "datacenter": sample.datacenter,
            "anomaly_score": score,
            "metrics": {
                "latency_ms": sample.latency_ms,
                "memory_used_percent": sample.memory_used_percent,
                "hit_rate": sample.hit_rate,
                "ops_per_second": sample.ops_per_second,
                "connected_clients": sample.connected_clients,
                "rejected_connections": sample.rejected_connections,
                "evicted_keys": sample.evicted_keys,
            },
            "contributing_factors": contributors,
        });

        self.alerts
            .send_alert(
                "anomaly_detected",
                severity,
                format!(
                    "Anomaly detected in instance {} (DC: {})",
                    sample.instance_name, sample.datacenter
                ),
                details,
            )
            .await;
    }

    /// Periodic training loop: initial settle, then roughly hourly re-fits.
    /// Flushes models to disk on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(300)) => {}
            _ = shutdown.changed() => {
                self.save_models();
                return;
            }
        }

        loop {
            self.train_all();
            self.save_models();

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                _ = shutdown.changed() => {
                    self.save_models();
                    info!("anomaly training loop stopped");
                    return;
                }
            }
        }
    }
}

/// Elevate a status according to how severe the anomaly score is
fn apply_severity(status: &mut HealthStatus, score: f64) {
    if score > 0.9 {
        status.status = HealthState::Failing;
        if score > 0.95 {
            status.can_serve_traffic = false;
        }
    } else if status.status == HealthState::Healthy {
        status.status = HealthState::Degraded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::alerting::tests::RecordingSink;
    use crate::agent::config::Endpoint;
    use crate::agent::health::evaluate_sample;

    fn test_instance(uid: &str) -> Instance {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "dc-a".to_string(),
            Endpoint {
                host: "localhost".to_string(),
                port: 6379,
            },
        );
        Instance {
            uid: uid.to_string(),
            name: format!("{}-name", uid),
            endpoints,
            active_dc: "dc-a".to_string(),
            password: None,
        }
    }

    fn normal_sample(uid: &str, i: usize) -> MetricsSample {
        MetricsSample {
            timestamp: i as f64,
            instance_uid: uid.to_string(),
            instance_name: format!("{}-name", uid),
            datacenter: "dc-a".to_string(),
            latency_ms: 18.0 + (i % 10) as f64 * 0.4,
            memory_used_bytes: 1 << 20,
            memory_max_bytes: 4 << 20,
            memory_used_percent: 40.0 + (i % 5) as f64,
            hit_rate: 0.93 + (i % 3) as f64 * 0.01,
            hits: 930,
            misses: 70,
            ops_per_second: 1000 + (i as u64 % 100),
            connected_clients: 50 + (i as u64 % 7),
            rejected_connections: 0,
            evicted_keys: 0,
            expired_keys: 2,
            api_metrics: HashMap::new(),
        }
    }

    fn outlier_sample(uid: &str) -> MetricsSample {
        let mut sample = normal_sample(uid, 0);
        sample.latency_ms = 400.0;
        sample.memory_used_percent = 94.0;
        sample.rejected_connections = 12;
        sample
    }

    fn detector_with_training(
        uid: &str,
        threshold: f64,
        samples: usize,
    ) -> (Arc<AnomalyDetector>, Arc<MetricsStore>, Arc<RecordingSink>) {
        let store = Arc::new(MetricsStore::new());
        let sink = RecordingSink::new();
        let detector = Arc::new(AnomalyDetector::new(
            "./models-test-unused",
            threshold,
            vec![test_instance(uid)],
            store.clone(),
            sink.clone(),
        ));

        for i in 0..samples {
            let sample = normal_sample(uid, i);
            let features = extract_features(&sample);
            store.append(sample, features);
        }
        (detector, store, sink)
    }

    #[test]
    fn test_feature_extraction_caps_and_defaults() {
        let mut sample = normal_sample("cache-01", 0);
        sample.ops_per_second = 50_000;
        sample.connected_clients = 9_000;
        let features = extract_features(&sample);
        assert_eq!(features.len(), FEATURE_NAMES.len());
        assert_eq!(features[3], 1.0);
        assert_eq!(features[4], 1.0);
        // Missing admin-API latency defaults to zero
        assert_eq!(features[7], 0.0);
    }

    #[test]
    fn test_warmup_boundary() {
        let (detector, store, _) = detector_with_training("cache-01", 0.8, 99);
        detector.train_instance("cache-01", "cache-01-name");
        assert!(!detector.is_trained("cache-01"));
        let features = extract_features(&outlier_sample("cache-01"));
        assert!(detector.score("cache-01", &features).is_none());

        // The hundredth sample enables training and scoring
        let sample = normal_sample("cache-01", 99);
        let f = extract_features(&sample);
        store.append(sample, f);
        detector.train_instance("cache-01", "cache-01-name");
        assert!(detector.is_trained("cache-01"));
        assert!(detector.score("cache-01", &features).is_some());
    }

    #[test]
    fn test_outlier_scores_above_baseline() {
        let (detector, _, _) = detector_with_training("cache-01", 0.8, 200);
        detector.train_instance("cache-01", "cache-01-name");

        let normal_score = detector
            .score("cache-01", &extract_features(&normal_sample("cache-01", 3)))
            .unwrap();
        let outlier_score = detector
            .score("cache-01", &extract_features(&outlier_sample("cache-01")))
            .unwrap();

        assert!(outlier_score > normal_score);
        assert!(outlier_score > 0.5);
    }

    #[test]
    fn test_score_is_deterministic_for_fixed_seed() {
        let (detector, _, _) = detector_with_training("cache-01", 0.8, 150);
        detector.train_instance("cache-01", "cache-01-name");
        let features = extract_features(&outlier_sample("cache-01"));
        let a = detector.score("cache-01", &features).unwrap();

        let (other, _, _) = detector_with_training("cache-01", 0.8, 150);
        other.train_instance("cache-01", "cache-01-name");
        let b = other.score("cache-01", &features).unwrap();
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn test_apply_severity_thresholds() {
        let mut status = HealthStatus::default();
        status.status = HealthState::Healthy;
        apply_severity(&mut status, 0.85);
        assert_eq!(status.status, HealthState::Degraded);
        assert!(status.can_serve_traffic);

        let mut status = HealthStatus::default();
        status.status = HealthState::Healthy;
        apply_severity(&mut status, 0.92);
        assert_eq!(status.status, HealthState::Failing);
        assert!(status.can_serve_traffic);

        let mut status = HealthStatus::default();
        status.status = HealthState::Healthy;
        apply_severity(&mut status, 0.97);
        assert_eq!(status.status, HealthState::Failing);
        assert!(!status.can_serve_traffic);
    }

    #[tokio::test]
    async fn test_consecutive_anomalies_and_alert() {
        // Low threshold so the outlier verdict is unambiguous
        let (detector, _, sink) = detector_with_training("cache-01", 0.5, 200);
        detector.train_instance("cache-01", "cache-01-name");

        let sample = outlier_sample("cache-01");
        let features = extract_features(&sample);

        let mut previous: Option<HealthStatus> = None;
        for round in 1..=3u32 {
            let mut status = evaluate_sample(&sample);
            let verdict = detector
                .process_sample(previous.as_ref(), &mut status, &sample, &features)
                .await;
            assert!(verdict.is_anomaly);
            assert_eq!(status.consecutive_anomalies, round);
            previous = Some(status);
        }

        // Third consecutive anomaly emits the alert with contributors
        let types = sink.types();
        assert_eq!(types, vec!["anomaly_detected".to_string()]);
        let alerts = sink.alerts.lock();
        let factors = &alerts[0].details["contributing_factors"];
        assert!(factors.get("latency_ms").is_some());
    }

    #[tokio::test]
    async fn test_non_anomalous_sample_resets_counter() {
        let (detector, _, _) = detector_with_training("cache-01", 0.99, 200);
        detector.train_instance("cache-01", "cache-01-name");

        let sample = normal_sample("cache-01", 5);
        let features = extract_features(&sample);
        let mut prior = HealthStatus::default();
        prior.consecutive_anomalies = 2;

        let mut status = evaluate_sample(&sample);
        let verdict = detector
            .process_sample(Some(&prior), &mut status, &sample, &features)
            .await;
        assert!(!verdict.is_anomaly);
        assert_eq!(status.consecutive_anomalies, 0);
        assert!(!status.is_anomaly);
    }

    #[test]
    fn test_model_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetricsStore::new());
        let sink = RecordingSink::new();
        let detector = AnomalyDetector::new(
            dir.path().to_str().unwrap(),
            0.8,
            vec![test_instance("cache-01")],
            store.clone(),
            sink.clone(),
        );
        detector.initialize().unwrap();

        for i in 0..150 {
            let sample = normal_sample("cache-01", i);
            let features = extract_features(&sample);
            store.append(sample, features);
        }
        detector.train_instance("cache-01", "cache-01-name");
        detector.save_models();

        assert!(dir.path().join("cache-01_model.json").exists());
        assert!(dir.path().join("cache-01_scaler.json").exists());

        let features = extract_features(&outlier_sample("cache-01"));
        let original_score = detector.score("cache-01", &features).unwrap();

        // A fresh detector resumes trained from the persisted artifacts
        let reloaded = AnomalyDetector::new(
            dir.path().to_str().unwrap(),
            0.8,
            vec![test_instance("cache-01")],
            store,
            sink,
        );
        reloaded.initialize().unwrap();
        assert!(reloaded.is_trained("cache-01"));
        let reloaded_score = reloaded.score("cache-01", &features).unwrap();
        assert!((original_score - reloaded_score).abs() < 1e-12);
    }
}
