//! Client-side log evidence from Elasticsearch
//!
//! Pulls recent client log documents for an instance and condenses them into
//! an error analysis: counts and flags per error category, a per-minute
//! histogram, detected error spikes, and an overall client impact level.
//! Results are cached per instance with a TTL so repeated decision ticks do
//! not hammer the search cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::agent::config::ElkConfig;
use crate::agent::metrics::now_epoch;

/// Maximum documents pulled per query
const MAX_LOGS: usize = 1000;

/// Severity levels treated as errors in client logs
const ERROR_LEVELS: &[&str] = &["ERROR", "SEVERE", "FATAL"];

/// Overall impact of client-side errors, monotone in the error rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientImpact {
    None,
    Low,
    Medium,
    High,
    Severe,
}

impl ClientImpact {
    pub fn from_error_rate(error_rate: f64) -> ClientImpact {
        if error_rate > 0.5 {
            ClientImpact::Severe
        } else if error_rate > 0.2 {
            ClientImpact::High
        } else if error_rate > 0.05 {
            ClientImpact::Medium
        } else if error_rate > 0.0 {
            ClientImpact::Low
        } else {
            ClientImpact::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientImpact::None => "none",
            ClientImpact::Low => "low",
            ClientImpact::Medium => "medium",
            ClientImpact::High => "high",
            ClientImpact::Severe => "severe",
        }
    }
}

/// Per-minute log/error counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinuteBucket {
    pub total: u64,
    pub errors: u64,
}

/// Summary of client-side errors over the query window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientErrorAnalysis {
    pub total_logs: usize,
    pub error_count: u64,
    pub error_rate: f64,
    pub has_connection_errors: bool,
    pub has_timeout_errors: bool,
    pub has_memory_errors: bool,
    pub has_authentication_errors: bool,
    pub connection_error_count: u64,
    pub timeout_error_count: u64,
    pub memory_error_count: u64,
    pub authentication_error_count: u64,
    pub client_impact: ClientImpact,
    /// Minute bucket (`YYYY-MM-DDTHH:MM`) -> counts
    pub error_distribution: HashMap<String, MinuteBucket>,
    /// Minute buckets with at least 3 errors and a majority error fraction
    pub error_spikes: Vec<String>,
}

impl Default for ClientErrorAnalysis {
    fn default() -> Self {
        ClientErrorAnalysis {
            total_logs: 0,
            error_count: 0,
            error_rate: 0.0,
            has_connection_errors: false,
            has_timeout_errors: false,
            has_memory_errors: false,
            has_authentication_errors: false,
            connection_error_count: 0,
            timeout_error_count: 0,
            memory_error_count: 0,
            authentication_error_count: 0,
            client_impact: ClientImpact::None,
            error_distribution: HashMap::new(),
            error_spikes: Vec::new(),
        }
    }
}

/// Capability interface consumed by the decision engine
#[async_trait::async_trait]
pub trait LogEvidenceSource: Send + Sync {
    /// Raw client log documents for an instance
    async fn client_logs(&self, instance_uid: &str, minutes: u64) -> Vec<Value>;

    /// Condensed error analysis over the same window
    async fn analyze_client_errors(&self, instance_uid: &str, minutes: u64) -> ClientErrorAnalysis;
}

fn doc_str<'a>(doc: &'a Value, key: &str) -> &'a str {
    doc.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Whether a log document counts as an error
pub fn is_error_log(doc: &Value) -> bool {
    let level = doc_str(doc, "level").to_uppercase();
    if ERROR_LEVELS.contains(&level.as_str()) {
        return true;
    }
    let message = doc_str(doc, "message").to_lowercase();
    message.contains("error") || message.contains("exception")
}

/// Derive the error analysis from a batch of log documents
pub fn analyze_logs(logs: &[Value]) -> ClientErrorAnalysis {
    if logs.is_empty() {
        return ClientErrorAnalysis::default();
    }

    let mut analysis = ClientErrorAnalysis::default();
    analysis.total_logs = logs.len();

    for log in logs {
        let message = doc_str(log, "message").to_lowercase();
        let is_error = is_error_log(log);

        if is_error {
            analysis.error_count += 1;

            if message.contains("connection") || message.contains("connect") {
                analysis.connection_error_count += 1;
            }
            if message.contains("timeout") || message.contains("timed out") {
                analysis.timeout_error_count += 1;
            }
            if message.contains("memory") || message.contains("oom") {
                analysis.memory_error_count += 1;
            }
            if message.contains("auth")
                || message.contains("password")
                || message.contains("unauthorized")
            {
                analysis.authentication_error_count += 1;
            }
        }

        let timestamp = doc_str(log, "@timestamp");
        if timestamp.len() >= 16 {
            let minute = timestamp[..16].to_string();
            let bucket = analysis.error_distribution.entry(minute).or_default();
            bucket.total += 1;
            if is_error {
                bucket.errors += 1;
            }
        }
    }

    analysis.has_connection_errors = analysis.connection_error_count > 0;
    analysis.has_timeout_errors = analysis.timeout_error_count > 0;
    analysis.has_memory_errors = analysis.memory_error_count > 0;
    analysis.has_authentication_errors = analysis.authentication_error_count > 0;

    analysis.error_rate = analysis.error_count as f64 / analysis.total_logs.max(1) as f64;
    analysis.client_impact = ClientImpact::from_error_rate(analysis.error_rate);

    let mut spikes: Vec<String> = analysis
        .error_distribution
        .iter()
        .filter(|(_, bucket)| {
            bucket.total > 0
                && bucket.errors >= 3
                && bucket.errors as f64 / bucket.total as f64 > 0.5
        })
        .map(|(minute, _)| minute.clone())
        .collect();
    spikes.sort();
    analysis.error_spikes = spikes;

    analysis
}

struct CacheEntry {
    fetched_at: f64,
    logs: Vec<Value>,
}

/// Elasticsearch-backed log evidence client with TTL caching
pub struct ElasticsearchClient {
    config: ElkConfig,
    /// instance uid -> display name, used in the query disjunction
    instance_names: HashMap<String, String>,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ElasticsearchClient {
    pub fn new(config: ElkConfig, instance_names: HashMap<String, String>) -> Arc<ElasticsearchClient> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Arc::new(ElasticsearchClient {
            config,
            instance_names,
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Compose the search query for an instance over a trailing window
    fn build_query(&self, instance_uid: &str, minutes: u64) -> Value {
        let now = Utc::now();
        let start = now - chrono::Duration::minutes(minutes as i64);
        let instance_name = self
            .instance_names
            .get(instance_uid)
            .cloned()
            .unwrap_or_else(|| instance_uid.to_string());

        let mut must = vec![
            json!({
                "range": {
                    "@timestamp": {
                        "gte": start.to_rfc3339_opts(SecondsFormat::Millis, true),
                        "lte": now.to_rfc3339_opts(SecondsFormat::Millis, true),
                    }
                }
            }),
            json!({
                "bool": {
                    "should": [
                        {"term": {"redis_instance.keyword": instance_uid}},
                        {"term": {"redis_instance_name.keyword": instance_name}},
                        {
                            "query_string": {
                                "query": format!(
                                    "message:*{}* OR message:*{}*",
                                    instance_uid, instance_name
                                ),
                                "analyze_wildcard": true,
                            }
                        }
                    ],
                    "minimum_should_match": 1
                }
            }),
        ];

        if self.config.client_logs_only {
            must.push(json!({"term": {"log_source.keyword": "client"}}));
        }

        if self.config.errors_only {
            must.push(json!({
                "bool": {
                    "should": [
                        {"terms": {"level.keyword": ["ERROR", "SEVERE", "FATAL", "WARNING"]}},
                        {
                            "query_string": {
                                "query": "message:*error* OR message:*exception* OR message:*timeout* OR message:*fail*",
                                "analyze_wildcard": true,
                            }
                        }
                    ],
                    "minimum_should_match": 1
                }
            }));
        }

        json!({
            "query": {"bool": {"must": must}},
            "sort": [{"@timestamp": {"order": "desc"}}],
            "size": MAX_LOGS,
        })
    }

    async fn query_search_service(&self, instance_uid: &str, minutes: u64) -> Vec<Value> {
        let url = match &self.config.url {
            Some(base) => format!("{}/{}/_search", base, self.config.index_pattern),
            None => return Vec::new(),
        };

        let query = self.build_query(instance_uid, minutes);
        let mut request = self.client.post(&url).json(&query);
        if let (Some(user), Some(password)) = (&self.config.username, &self.config.password) {
            request = request.basic_auth(user, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("error querying search service: {}", e);
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            error!("search service returned status {}", response.status());
            return Vec::new();
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                error!("failed to decode search response: {}", e);
                return Vec::new();
            }
        };

        let hits = body["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let mut logs = Vec::with_capacity(hits.len());
        for hit in hits {
            let mut source = hit.get("_source").cloned().unwrap_or(Value::Null);
            if let (Some(obj), Some(id)) = (source.as_object_mut(), hit.get("_id")) {
                obj.insert("_id".to_string(), id.clone());
            }
            if !source.is_null() {
                logs.push(source);
            }
        }

        info!(
            "retrieved {} client logs for instance {}",
            logs.len(),
            instance_uid
        );
        logs
    }
}

#[async_trait::async_trait]
impl LogEvidenceSource for ElasticsearchClient {
    async fn client_logs(&self, instance_uid: &str, minutes: u64) -> Vec<Value> {
        let now = now_epoch();
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(instance_uid) {
                if now - entry.fetched_at <= self.config.cache_ttl as f64 {
                    return entry.logs.clone();
                }
            }
        }

        let logs = self.query_search_service(instance_uid, minutes).await;
        self.cache.lock().insert(
            instance_uid.to_string(),
            CacheEntry {
                fetched_at: now,
                logs: logs.clone(),
            },
        );
        logs
    }

    async fn analyze_client_errors(&self, instance_uid: &str, minutes: u64) -> ClientErrorAnalysis {
        let logs = self.client_logs(instance_uid, minutes).await;
        analyze_logs(&logs)
    }
}
