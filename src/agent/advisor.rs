//! LLM-backed failover advisor
//!
//! Optional second opinion for failover decisions. The advisor sends the
//! instance's live metrics, the cross-datacenter health table, and a trimmed
//! sample of client logs to a chat-completion endpoint and parses a strictly
//! validated JSON verdict. Consultations are rate limited per instance; any
//! parse or validation failure degrades to a safe `no_action` verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::agent::config::AzureOpenAiConfig;
use crate::agent::health::HealthStatus;
use crate::agent::log_evidence::ClientErrorAnalysis;
use crate::agent::metrics::{now_epoch, MetricsSample};

/// Minimum seconds between consultations for the same instance
pub const CONSULTATION_INTERVAL_SECS: f64 = 300.0;

/// Maximum raw log entries included in the model context
const MAX_CONTEXT_LOGS: usize = 10;

const SYSTEM_PROMPT: &str = "You are an expert Redis database monitoring assistant that analyzes \
Redis metrics and client logs to determine if failover to another datacenter is needed.

Your task is to analyze the provided Redis metrics, health status, and client logs, and determine:
1. If failover is needed based on performance degradation or errors
2. Which datacenter should become the new active datacenter if failover is needed
3. How confident you are in this decision

Consider these factors in your analysis:
- Server-side metrics like latency, memory usage, hit rate, and errors
- Client-side logs showing connection errors, timeouts, or retries
- The relative health of alternative datacenters
- The potential impact of a failover (disruption vs benefit)

Avoid recommending failover unless there's strong evidence it will improve the situation. Look \
for corroborating evidence between server metrics and client logs.

YOUR RESPONSE MUST BE A VALID JSON OBJECT with these keys:
- recommendation: One of: \"failover\", \"no_action\", \"monitor\", \"manual_review\"
- target_dc: (Only if recommendation is \"failover\") Name of the recommended target datacenter
- confidence: Numeric value between 0 and 1 indicating confidence in your recommendation
- reason: Brief explanation of your reasoning
- potential_impact: Brief assessment of the impact of your recommendation
- primary_indicators: Array of the main metrics/logs that influenced your decision";

/// Advisor verdict categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Failover,
    NoAction,
    Monitor,
    ManualReview,
}

impl Verdict {
    fn parse(value: &str) -> Option<Verdict> {
        match value {
            "failover" => Some(Verdict::Failover),
            "no_action" => Some(Verdict::NoAction),
            "monitor" => Some(Verdict::Monitor),
            "manual_review" => Some(Verdict::ManualReview),
            _ => None,
        }
    }
}

/// A validated advisor decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecision {
    pub recommendation: Verdict,
    pub target_dc: Option<String>,
    pub confidence: f64,
    pub reason: String,
    pub potential_impact: Option<String>,
    pub primary_indicators: Vec<String>,
}

impl AiDecision {
    pub fn no_action<S: Into<String>>(reason: S) -> AiDecision {
        AiDecision {
            recommendation: Verdict::NoAction,
            target_dc: None,
            confidence: 0.0,
            reason: reason.into(),
            potential_impact: None,
            primary_indicators: Vec::new(),
        }
    }

    /// Parse and validate a raw completion body. Any defect collapses to a
    /// `no_action` verdict carrying the cause.
    pub fn from_response_text(text: &str) -> AiDecision {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return AiDecision::no_action("Failed to parse AI response"),
        };
        AiDecision::from_response_value(&parsed)
    }

    pub fn from_response_value(parsed: &Value) -> AiDecision {
        let recommendation = match parsed.get("recommendation").and_then(Value::as_str) {
            Some(value) => value,
            None => return AiDecision::no_action("Invalid response from AI"),
        };
        let recommendation = match Verdict::parse(recommendation) {
            Some(verdict) => verdict,
            None => return AiDecision::no_action("Invalid response from AI"),
        };

        let confidence = match parsed.get("confidence").and_then(Value::as_f64) {
            Some(value) if (0.0..=1.0).contains(&value) => value,
            _ => return AiDecision::no_action("Invalid response from AI"),
        };

        let reason = match parsed.get("reason").and_then(Value::as_str) {
            Some(value) => value.to_string(),
            None => return AiDecision::no_action("Invalid response from AI"),
        };

        let target_dc = parsed
            .get("target_dc")
            .and_then(Value::as_str)
            .map(str::to_string);
        if recommendation == Verdict::Failover && target_dc.is_none() {
            return AiDecision::no_action("Invalid response from AI");
        }

        let primary_indicators = parsed
            .get("primary_indicators")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        AiDecision {
            recommendation,
            target_dc,
            confidence,
            reason,
            potential_impact: parsed
                .get("potential_impact")
                .and_then(Value::as_str)
                .map(str::to_string),
            primary_indicators,
        }
    }
}

/// Everything the advisor needs to reason about one instance
pub struct AdvisorRequest<'a> {
    pub instance_uid: &'a str,
    pub instance_name: &'a str,
    pub active_dc: &'a str,
    pub metrics: Option<&'a MetricsSample>,
    pub client_logs: &'a [Value],
    pub log_summary: &'a ClientErrorAnalysis,
    pub health: &'a HashMap<String, HealthStatus>,
}

/// Capability interface used by the enhanced decision path
#[async_trait::async_trait]
pub trait FailoverAdvisor: Send + Sync {
    async fn analyze_situation(&self, request: AdvisorRequest<'_>) -> AiDecision;
}

/// Select the most relevant logs for the model context: logs for this
/// instance, error entries first, then most recent, deduplicated by id.
pub fn select_context_logs(logs: &[Value], instance_uid: &str) -> Vec<Value> {
    let instance_logs: Vec<&Value> = logs
        .iter()
        .filter(|log| {
            log.get("redis_instance").and_then(Value::as_str) == Some(instance_uid)
                || log
                    .get("message")
                    .and_then(Value::as_str)
                    .map(|m| m.contains(instance_uid))
                    .unwrap_or(false)
        })
        .collect();

    let is_relevant_error = |log: &Value| {
        let level = log.get("level").and_then(Value::as_str).unwrap_or("");
        if matches!(level, "ERROR" | "SEVERE" | "FATAL") {
            return true;
        }
        let message = log
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        message.contains("error") || message.contains("timeout") || message.contains("exception")
    };

    let mut selected: Vec<Value> = instance_logs
        .iter()
        .filter(|log| is_relevant_error(log))
        .take(MAX_CONTEXT_LOGS / 2)
        .map(|log| (*log).clone())
        .collect();

    let mut seen: Vec<String> = selected
        .iter()
        .filter_map(|log| log.get("_id").and_then(Value::as_str).map(str::to_string))
        .collect();

    let mut recent: Vec<&Value> = instance_logs.clone();
    recent.sort_by(|a, b| {
        let ta = a.get("@timestamp").and_then(Value::as_str).unwrap_or("");
        let tb = b.get("@timestamp").and_then(Value::as_str).unwrap_or("");
        tb.cmp(ta)
    });

    for log in recent {
        if selected.len() >= MAX_CONTEXT_LOGS {
            break;
        }
        let id = log.get("_id").and_then(Value::as_str).map(str::to_string);
        if let Some(id) = id {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
        }
        selected.push(log.clone());
    }

    selected.truncate(MAX_CONTEXT_LOGS);
    selected
}

/// Azure OpenAI chat-completion advisor with per-instance rate limiting
pub struct AzureOpenAiAdvisor {
    config: AzureOpenAiConfig,
    client: reqwest::Client,
    last_consultation_time: Mutex<HashMap<String, f64>>,
    last_decision: Mutex<HashMap<String, AiDecision>>,
}

impl AzureOpenAiAdvisor {
    pub fn new(config: AzureOpenAiConfig) -> Arc<AzureOpenAiAdvisor> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Arc::new(AzureOpenAiAdvisor {
            config,
            client,
            last_consultation_time: Mutex::new(HashMap::new()),
            last_decision: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the substitute decision when this consultation is rate
    /// limited, `None` when the call may proceed.
    fn check_rate_limit(&self, instance_uid: &str, now: f64) -> Option<AiDecision> {
        let last = self
            .last_consultation_time
            .lock()
            .get(instance_uid)
            .copied()
            .unwrap_or(0.0);

        if now - last < CONSULTATION_INTERVAL_SECS {
            let previous = self.last_decision.lock().get(instance_uid).cloned();
            return Some(previous.unwrap_or_else(|| AiDecision::no_action("Rate limited")));
        }
        None
    }

    fn record_decision(&self, instance_uid: &str, now: f64, decision: &AiDecision) {
        self.last_consultation_time
            .lock()
            .insert(instance_uid.to_string(), now);
        self.last_decision
            .lock()
            .insert(instance_uid.to_string(), decision.clone());
    }

    fn build_user_message(&self, request: &AdvisorRequest<'_>) -> String {
        let metrics_str = request
            .metrics
            .map(|m| serde_json::to_string_pretty(m).unwrap_or_default())
            .unwrap_or_else(|| "{}".to_string());
        let health_str = serde_json::to_string_pretty(request.health).unwrap_or_default();
        let summary_str = serde_json::to_string_pretty(request.log_summary).unwrap_or_default();
        let logs = select_context_logs(request.client_logs, request.instance_uid);
        let logs_str = serde_json::to_string_pretty(&logs).unwrap_or_default();

        format!(
            "I need to analyze the following Redis instance situation and decide if failover \
is needed:\n\n\
INSTANCE INFORMATION:\n\
- Name: {}\n\
- ID: {}\n\
- Current Active DC: {}\n\n\
CURRENT METRICS:\n{}\n\n\
HEALTH STATUS ACROSS DATACENTERS:\n{}\n\n\
CLIENT LOG SUMMARY STATISTICS:\n{}\n\n\
SAMPLE CLIENT LOGS:\n{}\n\n\
Based on this information, determine if a failover is needed, and if so, which datacenter \
should become the new active datacenter. Respond with a JSON object containing your \
recommendation and reasoning.",
            request.instance_name,
            request.instance_uid,
            request.active_dc,
            metrics_str,
            health_str,
            summary_str,
            logs_str,
        )
    }

    fn completion_url(&self) -> Option<String> {
        let endpoint = self.config.endpoint.as_ref()?;
        Some(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            self.config.model,
            self.config.api_version,
        ))
    }

    async fn consult(&self, request: &AdvisorRequest<'_>) -> AiDecision {
        let url = match self.completion_url() {
            Some(url) => url,
            None => return AiDecision::no_action("Advisor endpoint not configured"),
        };
        let api_key = match &self.config.api_key {
            Some(key) => key.clone(),
            None => return AiDecision::no_action("Advisor API key not configured"),
        };

        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": self.build_user_message(request)},
            ],
            "temperature": 0.2,
            "max_tokens": 1000,
            "response_format": {"type": "json_object"},
        });

        let response = match self
            .client
            .post(&url)
            .header("api-key", api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("error consulting advisor: {}", e);
                return AiDecision::no_action(format!("Error: {}", e));
            }
        };

        if !response.status().is_success() {
            error!("advisor returned status {}", response.status());
            return AiDecision::no_action(format!(
                "Advisor returned status {}",
                response.status()
            ));
        }

        let payload: Value = match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to decode advisor response: {}", e);
                return AiDecision::no_action("Failed to parse AI response");
            }
        };

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("");
        AiDecision::from_response_text(content)
    }
}

#[async_trait::async_trait]
impl FailoverAdvisor for AzureOpenAiAdvisor {
    async fn analyze_situation(&self, request: AdvisorRequest<'_>) -> AiDecision {
        let now = now_epoch();
        if let Some(substitute) = self.check_rate_limit(request.instance_uid, now) {
            return substitute;
        }

        let decision = self.consult(&request).await;
        info!(
            "advisor verdict for {}: {:?} (confidence {:.2})",
            request.instance_uid, decision.recommendation, decision.confidence
        );
        self.record_decision(request.instance_uid, now, &decision);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_response_parses() {
        let decision = AiDecision::from_response_text(
            r#"{
                "recommendation": "failover",
                "target_dc": "dc-b",
                "confidence": 0.85,
                "reason": "active DC is failing, dc-b is healthy",
                "potential_impact": "brief connection resets",
                "primary_indicators": ["latency_ms", "connection errors"]
            }"#,
        );
        assert_eq!(decision.recommendation, Verdict::Failover);
        assert_eq!(decision.target_dc.as_deref(), Some("dc-b"));
        assert_eq!(decision.confidence, 0.85);
        assert_eq!(decision.primary_indicators.len(), 2);
    }

    #[test]
    fn test_failover_without_target_is_rejected() {
        let decision = AiDecision::from_response_text(
            r#"{"recommendation": "failover", "confidence": 0.9, "reason": "x"}"#,
        );
        assert_eq!(decision.recommendation, Verdict::NoAction);
        assert_eq!(decision.confidence, 0.0);
    }

    #[test]
    fn test_out_of_range_confidence_is_rejected() {
        let decision = AiDecision::from_response_text(
            r#"{"recommendation": "monitor", "confidence": 1.3, "reason": "x"}"#,
        );
        assert_eq!(decision.recommendation, Verdict::NoAction);
    }

    #[test]
    fn test_unknown_recommendation_is_rejected() {
        let decision = AiDecision::from_response_text(
            r#"{"recommendation": "panic", "confidence": 0.5, "reason": "x"}"#,
        );
        assert_eq!(decision.recommendation, Verdict::NoAction);
    }

    #[test]
    fn test_garbage_body_is_rejected() {
        let decision = AiDecision::from_response_text("not json at all");
        assert_eq!(decision.recommendation, Verdict::NoAction);
        assert_eq!(decision.reason, "Failed to parse AI response");
    }

    #[test]
    fn test_rate_limit_returns_cached_decision() {
        let advisor = AzureOpenAiAdvisor::new(AzureOpenAiConfig::default());

        // First call proceeds
        assert!(advisor.check_rate_limit("cache-01", 1000.0).is_none());

        let decision = AiDecision {
            recommendation: Verdict::Monitor,
            target_dc: None,
            confidence: 0.6,
            reason: "watching".to_string(),
            potential_impact: None,
            primary_indicators: Vec::new(),
        };
        advisor.record_decision("cache-01", 1000.0, &decision);

        // Within the window, the cached verdict is substituted
        let substitute = advisor.check_rate_limit("cache-01", 1100.0).unwrap();
        assert_eq!(substitute.recommendation, Verdict::Monitor);
        assert_eq!(substitute.confidence, 0.6);

        // After the window, consultation is allowed again
        assert!(advisor.check_rate_limit("cache-01", 1301.0).is_none());
    }

    #[test]
    fn test_rate_limit_without_history_substitutes_no_action() {
        let advisor = AzureOpenAiAdvisor::new(AzureOpenAiConfig::default());
        advisor
            .last_consultation_time
            .lock()
            .insert("cache-01".to_string(), 1000.0);
        let substitute = advisor.check_rate_limit("cache-01", 1010.0).unwrap();
        assert_eq!(substitute.recommendation, Verdict::NoAction);
        assert_eq!(substitute.reason, "Rate limited");
    }

    fn context_log(id: &str, level: &str, timestamp: &str, message: &str) -> Value {
        json!({
            "_id": id,
            "level": level,
            "@timestamp": timestamp,
            "message": message,
            "redis_instance": "cache-01",
        })
    }

    #[test]
    fn test_context_log_selection_prioritizes_errors() {
        let mut logs = Vec::new();
        for i in 0..20 {
            logs.push(context_log(
                &format!("info-{}", i),
                "INFO",
                &format!("2024-03-01T10:{:02}:00Z", i),
                "request ok",
            ));
        }
        logs.push(context_log(
            "err-1",
            "ERROR",
            "2024-03-01T09:00:00Z",
            "connection timeout",
        ));

        let selected = select_context_logs(&logs, "cache-01");
        assert_eq!(selected.len(), MAX_CONTEXT_LOGS);
        // The error entry leads despite being the oldest document
        assert_eq!(selected[0]["_id"], "err-1");
        // No duplicates by id
        let mut ids: Vec<&str> = selected.iter().map(|l| l["_id"].as_str().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), MAX_CONTEXT_LOGS);
    }

    #[test]
    fn test_context_logs_filter_other_instances() {
        let logs = vec![
            json!({"_id": "a", "redis_instance": "other", "message": "nope", "@timestamp": "2024-03-01T10:00:00Z"}),
            json!({"_id": "b", "redis_instance": "cache-01", "message": "ok", "@timestamp": "2024-03-01T10:00:00Z"}),
            json!({"_id": "c", "message": "mentions cache-01 inline", "@timestamp": "2024-03-01T10:01:00Z"}),
        ];
        let selected = select_context_logs(&logs, "cache-01");
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|l| l["_id"] != "a"));
    }
}
