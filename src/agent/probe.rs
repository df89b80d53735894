//! Replica probing
//!
//! One probe cycle measures every `(instance, datacenter)` replica: a PING
//! round trip for latency, an INFO snapshot for the server-side metrics, and
//! optionally the latest 1-second statistics interval from the datacenter's
//! admin API. A probe that fails to complete publishes an error status and
//! bumps the consecutive error counter; the next successful probe resets it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use futures::future::join_all;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::agent::anomaly::{extract_features, AnomalyDetector};
use crate::agent::config::{Datacenter, Endpoint, Instance};
use crate::agent::context::AgentContext;
use crate::agent::health::{evaluate_sample, HealthStatus};
use crate::agent::metrics::{now_epoch, MetricsSample};

/// Connection establishment deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-operation deadline
const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Display, From, Error)]
pub enum ProbeError {
    Redis(redis::RedisError),
    #[display(fmt = "operation timed out after {:?}", _0)]
    Timeout(#[error(not(source))] Duration),
}

type Result<T> = std::result::Result<T, ProbeError>;

/// Admin-API interval fields recognized and their stored names
const API_METRIC_MAPPING: &[(&str, &str)] = &[
    ("total_req", "api_total_requests"),
    ("read_req", "api_read_requests"),
    ("write_req", "api_write_requests"),
    ("total_connections", "api_total_connections"),
    ("total_egress_bytes", "api_egress_bytes"),
    ("total_ingress_bytes", "api_ingress_bytes"),
    ("avg_latency", "api_avg_latency_ms"),
    ("avg_read_latency", "api_avg_read_latency_ms"),
    ("avg_write_latency", "api_avg_write_latency_ms"),
];

/// Parse an INFO dump into key/value pairs
pub fn parse_info(raw: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(idx) = line.find(':') {
            fields.insert(line[..idx].to_string(), line[idx + 1..].to_string());
        }
    }
    fields
}

fn info_u64(info: &HashMap<String, String>, key: &str) -> u64 {
    info.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Assemble a metrics sample from the probe measurements
pub fn build_sample(
    instance: &Instance,
    dc_name: &str,
    latency_ms: f64,
    info: &HashMap<String, String>,
    api_metrics: HashMap<String, f64>,
) -> MetricsSample {
    let memory_used_bytes = info_u64(info, "used_memory");
    let memory_max_bytes = info_u64(info, "maxmemory");
    let memory_used_percent = if memory_max_bytes > 0 {
        memory_used_bytes as f64 / memory_max_bytes as f64 * 100.0
    } else {
        0.0
    };

    let hits = info_u64(info, "keyspace_hits");
    let misses = info_u64(info, "keyspace_misses");

    MetricsSample {
        timestamp: now_epoch(),
        instance_uid: instance.uid.clone(),
        instance_name: instance.name.clone(),
        datacenter: dc_name.to_string(),
        latency_ms,
        memory_used_bytes,
        memory_max_bytes,
        memory_used_percent,
        hit_rate: MetricsSample::hit_rate(hits, misses),
        hits,
        misses,
        ops_per_second: info_u64(info, "instantaneous_ops_per_sec"),
        connected_clients: info_u64(info, "connected_clients"),
        rejected_connections: info_u64(info, "rejected_connections"),
        evicted_keys: info_u64(info, "evicted_keys"),
        expired_keys: info_u64(info, "expired_keys"),
        api_metrics,
    }
}

/// Extract the recognized fields from the latest statistics interval
pub fn map_api_interval(payload: &Value) -> HashMap<String, f64> {
    let mut metrics = HashMap::new();
    let latest = match payload
        .get("intervals")
        .and_then(Value::as_array)
        .and_then(|intervals| intervals.last())
    {
        Some(latest) => latest,
        None => return metrics,
    };

    for (source, target) in API_METRIC_MAPPING {
        if let Some(value) = latest.get(*source).and_then(Value::as_f64) {
            metrics.insert(target.to_string(), value);
        }
    }
    metrics
}

/// Probes every replica of every instance on the monitoring interval
pub struct ProbeRunner {
    context: Arc<AgentContext>,
    detector: Arc<AnomalyDetector>,
    api_client: reqwest::Client,
    /// Cached multiplexed connections, keyed by `uid/dc`; dropped on failure
    /// so the next tick reconnects lazily
    connections: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl ProbeRunner {
    pub fn new(context: Arc<AgentContext>, detector: Arc<AnomalyDetector>) -> Arc<ProbeRunner> {
        let api_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Arc::new(ProbeRunner {
            context,
            detector,
            api_client,
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn connection_key(instance_uid: &str, dc_name: &str) -> String {
        format!("{}/{}", instance_uid, dc_name)
    }

    async fn connection(
        &self,
        instance: &Instance,
        dc_name: &str,
        endpoint: &Endpoint,
    ) -> Result<MultiplexedConnection> {
        let key = Self::connection_key(&instance.uid, dc_name);
        if let Some(connection) = self.connections.lock().get(&key).cloned() {
            return Ok(connection);
        }

        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(endpoint.host.clone(), endpoint.port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password: instance.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;

        let connection = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| ProbeError::Timeout(CONNECT_TIMEOUT))??;

        debug!("connected to {} in datacenter {}", instance.name, dc_name);
        self.connections.lock().insert(key, connection.clone());
        Ok(connection)
    }

    fn drop_connection(&self, instance_uid: &str, dc_name: &str) {
        self.connections
            .lock()
            .remove(&Self::connection_key(instance_uid, dc_name));
    }

    async fn collect_sample(
        &self,
        instance: &Instance,
        dc_name: &str,
        endpoint: &Endpoint,
    ) -> Result<MetricsSample> {
        let mut connection = self.connection(instance, dc_name, endpoint).await?;

        let start = Instant::now();
        let ping = tokio::time::timeout(OPERATION_TIMEOUT, async {
            let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<String, redis::RedisError>(pong)
        })
        .await
        .map_err(|_| ProbeError::Timeout(OPERATION_TIMEOUT))??;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        if ping != "PONG" {
            return Err(ProbeError::Redis(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "unexpected PING reply",
            ))));
        }

        let raw_info = tokio::time::timeout(OPERATION_TIMEOUT, async {
            let raw: String = redis::cmd("INFO").query_async(&mut connection).await?;
            Ok::<String, redis::RedisError>(raw)
        })
        .await
        .map_err(|_| ProbeError::Timeout(OPERATION_TIMEOUT))??;

        let info = parse_info(&raw_info);
        let api_metrics = self.fetch_api_metrics(instance, dc_name).await;

        Ok(build_sample(instance, dc_name, latency_ms, &info, api_metrics))
    }

    /// Admin-API statistics for the instance's database in this datacenter.
    /// Failures degrade to an empty map rather than failing the probe.
    async fn fetch_api_metrics(&self, instance: &Instance, dc_name: &str) -> HashMap<String, f64> {
        let dc: &Datacenter = match self.context.config.datacenters.get(dc_name) {
            Some(dc) => dc,
            None => return HashMap::new(),
        };
        let api_url = match &dc.api_url {
            Some(url) => url,
            None => return HashMap::new(),
        };

        // The instance uid doubles as the admin-API database id
        let url = format!("{}/v1/bdbs/{}/stats?interval=1sec", api_url, instance.uid);
        let mut request = self.api_client.get(&url);
        if let (Some(user), Some(password)) = (&dc.api_user, &dc.api_password) {
            request = request.basic_auth(user, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "admin API request failed for {} in {}: {}",
                    instance.uid, dc_name, e
                );
                return HashMap::new();
            }
        };
        if !response.status().is_success() {
            warn!(
                "admin API returned status {} for {} in {}",
                response.status(),
                instance.uid,
                dc_name
            );
            return HashMap::new();
        }

        match response.json::<Value>().await {
            Ok(payload) => map_api_interval(&payload),
            Err(e) => {
                warn!("failed to decode admin API response: {}", e);
                HashMap::new()
            }
        }
    }

    /// One-shot connectivity check against each configured admin API.
    /// Failures only warn; the subsystem degrades to probe-only metrics.
    async fn check_admin_apis(&self) {
        for (dc_name, dc) in &self.context.config.datacenters {
            let api_url = match &dc.api_url {
                Some(url) => url,
                None => continue,
            };
            let mut request = self.api_client.get(format!("{}/v1/cluster", api_url));
            if let (Some(user), Some(password)) = (&dc.api_user, &dc.api_password) {
                request = request.basic_auth(user, Some(password));
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("connected to admin API in datacenter {}", dc_name);
                }
                Ok(response) => {
                    warn!(
                        "admin API connectivity check for datacenter {} returned status {}",
                        dc_name,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "admin API connectivity check failed for datacenter {}: {}",
                        dc_name, e
                    );
                }
            }
        }
    }

    async fn probe_replica(&self, instance: &Instance, dc_name: &str, endpoint: &Endpoint) {
        let previous = self.context.replica_health(&instance.uid, dc_name);

        match self.collect_sample(instance, dc_name, endpoint).await {
            Ok(sample) => {
                let features = extract_features(&sample);
                self.context.metrics.append(sample.clone(), features.clone());

                let mut status = evaluate_sample(&sample);
                // Anomaly fields are applied before the status is published,
                // so a reader never sees a sample without its verdict.
                self.detector
                    .process_sample(previous.as_ref(), &mut status, &sample, &features)
                    .await;
                self.context
                    .update_health_status(&instance.uid, dc_name, status);
            }
            Err(e) => {
                error!(
                    "error probing instance {} in datacenter {}: {}",
                    instance.name, dc_name, e
                );
                self.drop_connection(&instance.uid, dc_name);
                let status =
                    HealthStatus::from_probe_error(previous.as_ref(), now_epoch(), e.to_string());
                self.context
                    .update_health_status(&instance.uid, dc_name, status);
            }
        }
    }

    async fn probe_instance(&self, instance: &Instance) {
        // Replicas of one instance probe in parallel
        let probes = instance
            .endpoints
            .iter()
            .map(|(dc_name, endpoint)| self.probe_replica(instance, dc_name, endpoint));
        join_all(probes).await;
    }

    pub async fn probe_all(&self) {
        for instance in self.context.instances() {
            self.probe_instance(instance).await;
        }
    }

    /// Periodic probe loop, stopped by the shutdown signal
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        self.check_admin_apis().await;

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.context.config.monitoring_interval));
        info!("probe loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_all().await;
                }
                _ = shutdown.changed() => {
                    info!("probe loop stopped");
                    return;
                }
            }
        }
    }
}
