//! Alert management and delivery
//!
//! Typed events produced by the core loop fan out to the configured channels
//! (Slack incoming webhooks, PagerDuty events, generic webhooks). Alerts are
//! deduplicated per `(type, instance)` key with a severity-dependent minimum
//! interval; failover outcome alerts of error or critical severity always go
//! through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::agent::metrics::now_epoch;

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Minimum seconds between repeated alerts of this severity
    fn dedup_interval(&self) -> f64 {
        match self {
            Severity::Critical => 60.0,
            Severity::Error => 180.0,
            Severity::Warning => 300.0,
            Severity::Info => 600.0,
        }
    }

    fn slack_color(&self) -> &'static str {
        match self {
            Severity::Info => "#36a64f",
            Severity::Warning => "#ffcc00",
            Severity::Error => "#ff9900",
            Severity::Critical => "#ff0000",
        }
    }
}

/// Alert types that must never be suppressed once severe enough
const DEDUP_BYPASS_TYPES: &[&str] = &[
    "failover_succeeded",
    "failover_failed",
    "manual_failover_required",
];

/// A delivered (or deliverable) alert event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub details: Value,
    pub timestamp: f64,
    pub timestamp_str: String,
}

/// Capability interface used by the core components to emit events
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert_type: &str, severity: Severity, message: String, details: Value);
}

/// Multi-channel alert manager with deduplication and bounded history
pub struct AlertManager {
    endpoints: HashMap<String, Value>,
    client: reqwest::Client,
    history: Mutex<Vec<Alert>>,
    last_alert_time: Mutex<HashMap<String, f64>>,
}

const HISTORY_CAPACITY: usize = 1000;

impl AlertManager {
    pub fn new(endpoints: HashMap<String, Value>) -> Arc<AlertManager> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let manager = AlertManager {
            endpoints,
            client,
            history: Mutex::new(Vec::new()),
            last_alert_time: Mutex::new(HashMap::new()),
        };
        manager.validate_endpoints();
        Arc::new(manager)
    }

    fn validate_endpoints(&self) {
        if self.endpoints.is_empty() {
            warn!("no alert endpoints configured");
            return;
        }

        if let Some(slack) = self.endpoints.get("slack") {
            if slack.get("webhook_url").and_then(Value::as_str).is_none() {
                error!("slack alert endpoint is missing webhook_url");
            }
        }
        if let Some(pagerduty) = self.endpoints.get("pagerduty") {
            if pagerduty.get("service_key").and_then(Value::as_str).is_none() {
                error!("pagerduty alert endpoint is missing service_key");
            }
        }
        if let Some(webhook) = self.endpoints.get("webhook") {
            if webhook.get("url").and_then(Value::as_str).is_none() {
                error!("webhook alert endpoint is missing url");
            }
        }
    }

    /// Whether this alert passes the dedup window
    fn should_send(&self, alert: &Alert) -> bool {
        if DEDUP_BYPASS_TYPES.contains(&alert.alert_type.as_str())
            && alert.severity >= Severity::Error
        {
            return true;
        }

        let key = match alert.details.get("instance_uid").and_then(Value::as_str) {
            Some(uid) => format!("{}_{}", alert.alert_type, uid),
            None => alert.alert_type.clone(),
        };

        let last = self.last_alert_time.lock().get(&key).copied().unwrap_or(0.0);
        alert.timestamp - last >= alert.severity.dedup_interval()
    }

    fn record(&self, alert: &Alert) {
        let key = match alert.details.get("instance_uid").and_then(Value::as_str) {
            Some(uid) => format!("{}_{}", alert.alert_type, uid),
            None => alert.alert_type.clone(),
        };
        self.last_alert_time.lock().insert(key, alert.timestamp);

        let mut history = self.history.lock();
        history.push(alert.clone());
        if history.len() > HISTORY_CAPACITY {
            let excess = history.len() - HISTORY_CAPACITY;
            history.drain(0..excess);
        }
    }

    /// Recent alerts, newest first, optionally filtered
    pub fn alert_history(
        &self,
        limit: usize,
        severity: Option<Severity>,
        alert_type: Option<&str>,
    ) -> Vec<Alert> {
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
            .filter(|a| alert_type.map(|t| a.alert_type == t).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn send_to_slack(&self, alert: &Alert) {
        let slack = match self.endpoints.get("slack") {
            Some(s) => s,
            None => return,
        };
        let webhook_url = match slack.get("webhook_url").and_then(Value::as_str) {
            Some(url) => url,
            None => return,
        };

        let mut fields = vec![
            json!({"title": "Severity", "value": alert.severity.as_str().to_uppercase(), "short": true}),
            json!({"title": "Time", "value": alert.timestamp_str, "short": true}),
        ];
        if let Some(name) = alert.details.get("instance_name").and_then(Value::as_str) {
            fields.push(json!({"title": "Instance", "value": name, "short": true}));
        }
        if let Some(dc) = alert.details.get("datacenter").and_then(Value::as_str) {
            fields.push(json!({"title": "Datacenter", "value": dc, "short": true}));
        }
        if let (Some(from), Some(to)) = (
            alert.details.get("from_dc").and_then(Value::as_str),
            alert.details.get("to_dc").and_then(Value::as_str),
        ) {
            fields.push(json!({
                "title": "Failover",
                "value": format!("From {} to {}", from, to),
                "short": true
            }));
        }
        if let Some(score) = alert.details.get("anomaly_score").and_then(Value::as_f64) {
            fields.push(json!({
                "title": "Anomaly Score",
                "value": format!("{:.2}", score),
                "short": true
            }));
        }
        if let Some(reason) = alert.details.get("reason").and_then(Value::as_str) {
            fields.push(json!({"title": "Reason", "value": reason, "short": false}));
        }

        let payload = json!({
            "attachments": [{
                "fallback": alert.message,
                "color": alert.severity.slack_color(),
                "pretext": "Meridian Alert",
                "title": alert.message,
                "fields": fields,
                "footer": format!("meridian \u{2022} {}", alert.alert_type),
            }]
        });

        match self.client.post(webhook_url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                error!("slack alert delivery returned status {}", response.status());
            }
            Ok(_) => {}
            Err(e) => error!("slack alert delivery failed: {}", e),
        }
    }

    async fn send_to_pagerduty(&self, alert: &Alert) {
        let pagerduty = match self.endpoints.get("pagerduty") {
            Some(p) => p,
            None => return,
        };
        let service_key = match pagerduty.get("service_key").and_then(Value::as_str) {
            Some(key) => key,
            None => return,
        };

        // Only page on high severities
        if alert.severity < Severity::Error {
            return;
        }

        let payload = json!({
            "service_key": service_key,
            "event_type": "trigger",
            "incident_key": alert.id,
            "description": alert.message,
            "details": alert.details,
            "client": "meridian",
            "client_url": pagerduty.get("client_url").and_then(Value::as_str).unwrap_or(""),
        });

        match self
            .client
            .post("https://events.pagerduty.com/generic/2010-04-15/create_event.json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                error!("pagerduty alert delivery returned status {}", response.status());
            }
            Ok(_) => info!("sent pagerduty alert {}", alert.id),
            Err(e) => error!("pagerduty alert delivery failed: {}", e),
        }
    }

    async fn send_to_webhook(&self, alert: &Alert) {
        let webhook = match self.endpoints.get("webhook") {
            Some(w) => w,
            None => return,
        };
        let url = match webhook.get("url").and_then(Value::as_str) {
            Some(url) => url,
            None => return,
        };

        if let Err(e) = self.client.post(url).json(alert).send().await {
            error!("webhook alert delivery failed: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl AlertSink for AlertManager {
    async fn send_alert(
        &self,
        alert_type: &str,
        severity: Severity,
        message: String,
        details: Value,
    ) {
        let timestamp = now_epoch();
        let timestamp_str = Utc
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        let alert = Alert {
            id: format!("{}_{}", alert_type, timestamp as u64),
            alert_type: alert_type.to_string(),
            severity,
            message,
            details,
            timestamp,
            timestamp_str,
        };

        if !self.should_send(&alert) {
            debug!("rate limiting alert {}", alert.id);
            return;
        }

        match severity {
            Severity::Info => info!("ALERT: {}", alert.message),
            Severity::Warning => warn!("ALERT: {}", alert.message),
            Severity::Error | Severity::Critical => error!("ALERT: {}", alert.message),
        }

        self.send_to_slack(&alert).await;
        self.send_to_pagerduty(&alert).await;
        self.send_to_webhook(&alert).await;

        self.record(&alert);
    }
}
