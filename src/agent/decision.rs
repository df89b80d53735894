//! Failover decision engine
//!
//! Evaluates every instance once per decision interval. The standard path
//! reacts to an active replica that can no longer serve traffic: it scores
//! the alternatives, derives a confidence from the active replica's
//! condition and the failover cooldown, and either executes or asks for
//! manual intervention. When an advisor is configured and the situation
//! warrants a second opinion, the enhanced path defers to the advisor's
//! verdict, guarded by a two-in-a-row consistency rule.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agent::advisor::{AdvisorRequest, AiDecision, FailoverAdvisor, Verdict};
use crate::agent::alerting::{AlertSink, Severity};
use crate::agent::config::Instance;
use crate::agent::context::AgentContext;
use crate::agent::dns_failover::DnsFailover;
use crate::agent::health::{HealthState, HealthStatus};
use crate::agent::log_evidence::{ClientErrorAnalysis, ClientImpact, LogEvidenceSource};
use crate::agent::metrics::now_epoch;

/// Bounded history of executed and proposed failovers
const DECISION_HISTORY_CAPACITY: usize = 100;

/// Advisor recommendations retained per instance
const AI_RECOMMENDATION_CAPACITY: usize = 5;

/// Delay before the post-failover impact audit
const POST_FAILOVER_AUDIT_DELAY: Duration = Duration::from_secs(300);

/// Window used for the pre/post failover error comparison
const AUDIT_WINDOW_MINUTES: u64 = 10;

/// A failover decision with its reasoning and confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverDecision {
    pub id: String,
    pub instance_uid: String,
    pub instance_name: String,
    pub from_dc: String,
    pub to_dc: String,
    pub confidence: f64,
    pub reason: String,
    pub metrics: Value,
    pub timestamp: f64,
}

impl FailoverDecision {
    pub fn new(
        instance: &Instance,
        from_dc: &str,
        to_dc: &str,
        confidence: f64,
        reason: String,
        metrics: Value,
    ) -> FailoverDecision {
        let timestamp = now_epoch();
        FailoverDecision {
            id: format!("{}|{}", instance.uid, timestamp as u64),
            instance_uid: instance.uid.clone(),
            instance_name: instance.name.clone(),
            from_dc: from_dc.to_string(),
            to_dc: to_dc.to_string(),
            confidence,
            reason,
            metrics,
            timestamp,
        }
    }
}

/// One advisor verdict retained for the consistency rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRecommendation {
    pub timestamp: f64,
    pub recommendation: Verdict,
    pub target_dc: Option<String>,
    pub confidence: f64,
}

/// Score an alternative replica; higher is better
pub fn replica_score(status: &HealthStatus) -> f64 {
    let mut score = match status.status {
        HealthState::Healthy => 100.0,
        HealthState::Degraded => 50.0,
        _ => 0.0,
    };

    score += (50.0 - status.latency_ms / 2.0).max(0.0);

    if status.memory_used_percent < 80.0 {
        score += (100.0 - status.memory_used_percent) / 2.0;
    }

    score += status.hit_rate * 30.0;

    score -= 10.0 * status.consecutive_errors as f64;
    score -= 5.0 * status.consecutive_anomalies as f64;

    score
}

/// Pick the best alternative replica that can serve traffic
pub fn find_best_alternative(
    active_dc: &str,
    health: &HashMap<String, HealthStatus>,
) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for (dc_name, status) in health {
        if dc_name == active_dc || !status.can_serve_traffic {
            continue;
        }
        let score = replica_score(status);
        match &best {
            Some((_, best_score)) if *best_score >= score => {}
            _ => best = Some((dc_name.clone(), score)),
        }
    }
    best.map(|(dc, _)| dc)
}

/// Confidence that a failover from `active` to `target` is warranted.
/// Returns the clamped confidence and the contributing reasons.
pub fn compute_confidence(
    active: &HealthStatus,
    target: &HealthStatus,
    active_dc: &str,
    target_dc: &str,
    last_failover: f64,
    now: f64,
) -> (f64, Vec<String>) {
    let mut confidence: f64 = 0.5;
    let mut reasons = Vec::new();

    if active.status == HealthState::Failed {
        confidence += 0.4;
        reasons.push(format!("Active DC ({}) has failed", active_dc));
    }

    if active.consecutive_errors >= 3 {
        confidence += 0.3;
        reasons.push(format!(
            "Active DC has {} consecutive errors",
            active.consecutive_errors
        ));
    }

    if active.status == HealthState::Failing {
        confidence += 0.2;
        reasons.push(format!("Active DC ({}) is failing", active_dc));
    }

    if active.memory_used_percent > 95.0 {
        confidence += 0.2;
        reasons.push(format!(
            "Active DC memory usage critical: {:.1}%",
            active.memory_used_percent
        ));
    }

    if active.latency_ms > 500.0 {
        confidence += 0.15;
        reasons.push(format!(
            "Active DC latency critical: {:.1}ms",
            active.latency_ms
        ));
    }

    if target.status == HealthState::Healthy && active.status != HealthState::Healthy {
        confidence += 0.1;
        reasons.push(format!("Target DC ({}) is healthy", target_dc));
    }

    let since_last = now - last_failover;
    if since_last < 3600.0 {
        confidence -= 0.3;
        reasons.push(format!("Recent failover ({:.0} seconds ago)", since_last));
    } else if since_last < 86_400.0 {
        confidence -= 0.1;
        reasons.push("Failover in last 24 hours".to_string());
    }

    (confidence.max(0.0).min(1.0), reasons)
}

/// Whether the current snapshot warrants consulting the advisor
pub fn should_consult_advisor(
    active: &HealthStatus,
    analysis: &ClientErrorAnalysis,
) -> bool {
    if matches!(active.status, HealthState::Failing | HealthState::Failed) {
        return true;
    }
    if active.consecutive_errors >= 2 {
        return true;
    }
    if active.is_anomaly && active.anomaly_score > 0.7 {
        return true;
    }
    if matches!(
        analysis.client_impact,
        ClientImpact::Medium | ClientImpact::High | ClientImpact::Severe
    ) {
        return true;
    }
    if analysis.error_rate > 0.05 {
        return true;
    }
    if analysis.has_connection_errors || analysis.has_timeout_errors {
        return true;
    }
    if active.memory_used_percent > 90.0 {
        return true;
    }
    if active.latency_ms > 200.0 {
        return true;
    }
    if analysis.error_count > 10 {
        return true;
    }
    false
}

/// Classify the post-failover client impact from the error-rate ratio
pub fn classify_impact(pre_error_rate: f64, post_error_rate: f64) -> &'static str {
    if post_error_rate < pre_error_rate * 0.5 {
        "Significant improvement"
    } else if post_error_rate < pre_error_rate {
        "Slight improvement"
    } else if post_error_rate > pre_error_rate * 1.5 {
        "Situation worsened"
    } else {
        "No significant change"
    }
}

/// Emit the `failover_impact` event for a completed audit
async fn publish_failover_impact(
    alerts: &dyn AlertSink,
    instance_uid: &str,
    pre_analysis: &ClientErrorAnalysis,
    post_analysis: &ClientErrorAnalysis,
) {
    let impact = classify_impact(pre_analysis.error_rate, post_analysis.error_rate);
    info!(
        "post-failover analysis for {}: {}. Error rate: {:.2}% -> {:.2}%",
        instance_uid,
        impact,
        pre_analysis.error_rate * 100.0,
        post_analysis.error_rate * 100.0
    );

    let severity = if impact == "Situation worsened" {
        Severity::Warning
    } else {
        Severity::Info
    };

    alerts
        .send_alert(
            "failover_impact",
            severity,
            format!("Failover impact for {}: {}", instance_uid, impact),
            json!({
                "instance_uid": instance_uid,
                "impact": impact,
                "pre_failover_error_rate": pre_analysis.error_rate,
                "post_failover_error_rate": post_analysis.error_rate,
                "pre_failover_error_count": pre_analysis.error_count,
                "post_failover_error_count": post_analysis.error_count,
            }),
        )
        .await;
}

fn status_summary(status: &HealthStatus) -> Value {
    json!({
        "status": status.status.as_str(),
        "latency_ms": status.latency_ms,
        "memory_used_percent": status.memory_used_percent,
        "hit_rate": status.hit_rate,
        "consecutive_errors": status.consecutive_errors,
        "can_serve_traffic": status.can_serve_traffic,
    })
}

/// Drives failover decisions and executes them through the DNS executor
pub struct FailoverManager {
    context: Arc<AgentContext>,
    executor: Option<DnsFailover>,
    alerts: Arc<dyn AlertSink>,
    advisor: Option<Arc<dyn FailoverAdvisor>>,
    evidence: Option<Arc<dyn LogEvidenceSource>>,
    decisions: Mutex<VecDeque<FailoverDecision>>,
    last_failover_time: Mutex<HashMap<String, f64>>,
    ai_recommendations: Mutex<HashMap<String, VecDeque<AiRecommendation>>>,
}

impl FailoverManager {
    pub fn new(
        context: Arc<AgentContext>,
        executor: Option<DnsFailover>,
        alerts: Arc<dyn AlertSink>,
        advisor: Option<Arc<dyn FailoverAdvisor>>,
        evidence: Option<Arc<dyn LogEvidenceSource>>,
    ) -> Arc<FailoverManager> {
        Arc::new(FailoverManager {
            context,
            executor,
            alerts,
            advisor,
            evidence,
            decisions: Mutex::new(VecDeque::new()),
            last_failover_time: Mutex::new(HashMap::new()),
            ai_recommendations: Mutex::new(HashMap::new()),
        })
    }

    /// Executed and proposed failovers, oldest first
    pub fn decision_history(&self) -> Vec<FailoverDecision> {
        self.decisions.lock().iter().cloned().collect()
    }

    fn last_failover(&self, instance_uid: &str) -> f64 {
        self.last_failover_time
            .lock()
            .get(instance_uid)
            .copied()
            .unwrap_or(0.0)
    }

    fn record_decision(&self, decision: &FailoverDecision) {
        let mut decisions = self.decisions.lock();
        decisions.push_back(decision.clone());
        if decisions.len() > DECISION_HISTORY_CAPACITY {
            decisions.pop_front();
        }
    }

    /// Evaluate one instance for failover
    pub async fn check_instance(&self, instance: &Instance) {
        let health = self.context.instance_health(&instance.uid);
        if health.is_empty() {
            return;
        }

        let active_dc = match self.context.active_dc(&instance.uid) {
            Some(dc) => dc,
            None => return,
        };
        let active_status = match health.get(&active_dc) {
            Some(status) => status.clone(),
            None => {
                // Inconsistent snapshot; skip rather than act on it
                warn!(
                    "no health status for active DC {} of instance {}",
                    active_dc, instance.uid
                );
                return;
            }
        };

        if let Some(advisor) = self.advisor.clone() {
            let analysis = match &self.evidence {
                Some(evidence) => evidence.analyze_client_errors(&instance.uid, 30).await,
                None => ClientErrorAnalysis::default(),
            };

            if should_consult_advisor(&active_status, &analysis) {
                let logs = match &self.evidence {
                    Some(evidence) => evidence.client_logs(&instance.uid, 30).await,
                    None => Vec::new(),
                };
                self.check_instance_enhanced(instance, &active_dc, &health, &analysis, &logs, advisor)
                    .await;
                return;
            }
        }

        self.check_instance_standard(instance, &active_dc, &health, &active_status)
            .await;
    }

    async fn check_instance_standard(
        &self,
        instance: &Instance,
        active_dc: &str,
        health: &HashMap<String, HealthStatus>,
        active_status: &HealthStatus,
    ) {
        // The active replica still serves traffic; nothing to decide
        if active_status.can_serve_traffic {
            return;
        }

        let alternative = match find_best_alternative(active_dc, health) {
            Some(dc) => dc,
            None => {
                warn!(
                    "no healthy alternative DC found for instance {}",
                    instance.name
                );
                return;
            }
        };

        let target_status = match health.get(&alternative) {
            Some(status) => status,
            None => return,
        };

        let (confidence, reasons) = compute_confidence(
            active_status,
            target_status,
            active_dc,
            &alternative,
            self.last_failover(&instance.uid),
            now_epoch(),
        );

        let decision = FailoverDecision::new(
            instance,
            active_dc,
            &alternative,
            confidence,
            reasons.join("; "),
            json!({
                "active_dc": status_summary(active_status),
                "target_dc": status_summary(target_status),
            }),
        );

        if confidence >= self.context.config.failover_confidence_threshold
            && self.context.config.auto_failover
        {
            self.execute_failover(&decision).await;
        } else {
            info!(
                "not executing failover for {} (confidence {:.2}): {}",
                instance.name, confidence, decision.reason
            );
            self.send_manual_intervention_alert(&decision).await;
        }
    }

    async fn check_instance_enhanced(
        &self,
        instance: &Instance,
        active_dc: &str,
        health: &HashMap<String, HealthStatus>,
        analysis: &ClientErrorAnalysis,
        logs: &[Value],
        advisor: Arc<dyn FailoverAdvisor>,
    ) {
        let latest = self.context.metrics.latest(&instance.uid, 1).pop();
        let request = AdvisorRequest {
            instance_uid: &instance.uid,
            instance_name: &instance.name,
            active_dc,
            metrics: latest.as_ref(),
            client_logs: logs,
            log_summary: analysis,
            health,
        };

        let ai_decision = advisor.analyze_situation(request).await;
        self.track_ai_recommendation(&instance.uid, &ai_decision);

        if self.should_execute_ai_recommendation(&instance.uid, &ai_decision) {
            let target_dc = match &ai_decision.target_dc {
                Some(dc) => dc.clone(),
                None => return,
            };
            let decision = FailoverDecision::new(
                instance,
                active_dc,
                &target_dc,
                ai_decision.confidence,
                format!("AI recommended: {}", ai_decision.reason),
                json!({
                    "primary_indicators": ai_decision.primary_indicators,
                    "potential_impact": ai_decision.potential_impact,
                    "client_error_rate": analysis.error_rate,
                }),
            );

            if self.context.config.auto_failover {
                self.execute_failover(&decision).await;
            } else {
                warn!(
                    "advisor recommended failover for {} but auto_failover is disabled",
                    instance.name
                );
                self.send_manual_intervention_alert(&decision).await;
            }
        } else if ai_decision.recommendation == Verdict::Failover {
            if let Some(target_dc) = &ai_decision.target_dc {
                let decision = FailoverDecision::new(
                    instance,
                    active_dc,
                    target_dc,
                    ai_decision.confidence,
                    format!("AI recommended: {}", ai_decision.reason),
                    json!({"client_error_rate": analysis.error_rate}),
                );
                self.send_manual_intervention_alert(&decision).await;
            }
        }
    }

    fn track_ai_recommendation(&self, instance_uid: &str, decision: &AiDecision) {
        let mut recommendations = self.ai_recommendations.lock();
        let ring = recommendations
            .entry(instance_uid.to_string())
            .or_insert_with(VecDeque::new);
        ring.push_back(AiRecommendation {
            timestamp: now_epoch(),
            recommendation: decision.recommendation,
            target_dc: decision.target_dc.clone(),
            confidence: decision.confidence,
        });
        if ring.len() > AI_RECOMMENDATION_CAPACITY {
            ring.pop_front();
        }
    }

    /// The two-in-a-row consistency rule: the current verdict executes only
    /// when the immediately prior recommendation also called for failover to
    /// the same datacenter with sufficient confidence.
    fn should_execute_ai_recommendation(&self, instance_uid: &str, decision: &AiDecision) -> bool {
        if decision.recommendation != Verdict::Failover || decision.target_dc.is_none() {
            return false;
        }

        let min_confidence = self.context.config.ai_failover_confidence;
        if decision.confidence < min_confidence {
            return false;
        }

        let recommendations = self.ai_recommendations.lock();
        let ring = match recommendations.get(instance_uid) {
            Some(ring) => ring,
            None => return false,
        };
        // The current verdict is already recorded; consult the one before it
        if ring.len() < 2 {
            return false;
        }
        let prior = &ring[ring.len() - 2];

        prior.recommendation == Verdict::Failover
            && prior.target_dc == decision.target_dc
            && prior.confidence >= min_confidence
    }

    /// Execute a failover decision. Only a fully successful record rewrite
    /// mutates the active datacenter.
    pub async fn execute_failover(&self, decision: &FailoverDecision) -> bool {
        info!(
            "executing failover for {} from {} to {}",
            decision.instance_name, decision.from_dc, decision.to_dc
        );

        let instance = match self.context.config.instance(&decision.instance_uid) {
            Some(instance) => instance.clone(),
            None => {
                error!("instance {} not found", decision.instance_uid);
                return false;
            }
        };

        let executor = match &self.executor {
            Some(executor) => executor,
            None => {
                error!("no failover provider configured");
                self.send_failover_alert(decision, false, Some("no failover provider configured"))
                    .await;
                return false;
            }
        };

        // Capture the client error baseline for the post-failover audit
        let pre_analysis = match &self.evidence {
            Some(evidence) => Some(
                evidence
                    .analyze_client_errors(&decision.instance_uid, AUDIT_WINDOW_MINUTES)
                    .await,
            ),
            None => None,
        };

        match executor
            .perform_failover(&instance, &decision.from_dc, &decision.to_dc)
            .await
        {
            Ok(()) => {
                self.context
                    .switch_active_dc(&decision.instance_uid, &decision.to_dc);
                self.last_failover_time
                    .lock()
                    .insert(decision.instance_uid.clone(), now_epoch());
                self.record_decision(decision);
                self.send_failover_alert(decision, true, None).await;
                self.schedule_post_failover_audit(&decision.instance_uid, pre_analysis);
                info!(
                    "failover successful for {} to {}",
                    decision.instance_name, decision.to_dc
                );
                true
            }
            Err(e) => {
                error!(
                    "failover failed for {} to {}: {}",
                    decision.instance_name, decision.to_dc, e
                );
                self.send_failover_alert(decision, false, Some(&e.to_string()))
                    .await;
                false
            }
        }
    }

    /// Manual failover bypasses confidence gating but still records the
    /// cooldown timestamp and schedules the impact audit.
    pub async fn perform_manual_failover(
        &self,
        instance_uid: &str,
        target_dc: &str,
        reason: Option<String>,
    ) -> bool {
        let instance = match self.context.config.instance(instance_uid) {
            Some(instance) => instance.clone(),
            None => {
                error!("instance {} not found", instance_uid);
                return false;
            }
        };
        let from_dc = self
            .context
            .active_dc(instance_uid)
            .unwrap_or_else(|| instance.active_dc.clone());

        let decision = FailoverDecision::new(
            &instance,
            &from_dc,
            target_dc,
            1.0,
            reason.unwrap_or_else(|| "Manual failover requested".to_string()),
            json!({}),
        );
        self.execute_failover(&decision).await
    }

    fn schedule_post_failover_audit(
        &self,
        instance_uid: &str,
        pre_analysis: Option<ClientErrorAnalysis>,
    ) {
        let evidence = match &self.evidence {
            Some(evidence) => evidence.clone(),
            None => return,
        };
        let pre_analysis = match pre_analysis {
            Some(analysis) => analysis,
            None => return,
        };
        let alerts = self.alerts.clone();
        let instance_uid = instance_uid.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(POST_FAILOVER_AUDIT_DELAY).await;
            let post_analysis = evidence
                .analyze_client_errors(&instance_uid, AUDIT_WINDOW_MINUTES)
                .await;
            publish_failover_impact(&*alerts, &instance_uid, &pre_analysis, &post_analysis).await;
        });
    }

    /// Compare pre/post failover client error rates and publish the outcome
    pub async fn run_post_failover_audit(
        &self,
        instance_uid: &str,
        pre_analysis: &ClientErrorAnalysis,
        post_analysis: &ClientErrorAnalysis,
    ) {
        publish_failover_impact(&*self.alerts, instance_uid, pre_analysis, post_analysis).await;
    }

    async fn send_failover_alert(
        &self,
        decision: &FailoverDecision,
        success: bool,
        error: Option<&str>,
    ) {
        let (alert_type, severity) = if success {
            ("failover_succeeded", Severity::Info)
        } else {
            ("failover_failed", Severity::Error)
        };

        let mut message = format!(
            "Failover {} for {}",
            if success { "succeeded" } else { "failed" },
            decision.instance_name
        );
        if let Some(error) = error {
            message = format!("{}: {}", message, error);
        }

        let mut details = json!({
            "instance_uid": decision.instance_uid,
            "instance_name": decision.instance_name,
            "from_dc": decision.from_dc,
            "to_dc": decision.to_dc,
            "confidence": decision.confidence,
            "reason": decision.reason,
            "metrics": decision.metrics,
            "timestamp": decision.timestamp,
        });
        if let (Some(obj), Some(error)) = (details.as_object_mut(), error) {
            obj.insert("error".to_string(), json!(error));
        }

        self.alerts
            .send_alert(alert_type, severity, message, details)
            .await;
    }

    async fn send_manual_intervention_alert(&self, decision: &FailoverDecision) {
        self.alerts
            .send_alert(
                "manual_failover_required",
                Severity::Warning,
                format!(
                    "Manual failover required for {} from {} to {}",
                    decision.instance_name, decision.from_dc, decision.to_dc
                ),
                json!({
                    "instance_uid": decision.instance_uid,
                    "instance_name": decision.instance_name,
                    "from_dc": decision.from_dc,
                    "to_dc": decision.to_dc,
                    "confidence": decision.confidence,
                    "reason": decision.reason,
                    "metrics": decision.metrics,
                    "timestamp": decision.timestamp,
                }),
            )
            .await;
    }

    /// Periodic decision loop with an initial settle period
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            _ = shutdown.changed() => return,
        }

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.context.config.decision_interval));
        info!("decision loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let instances = self.context.config.instances.clone();
                    for instance in &instances {
                        self.check_instance(instance).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("decision loop stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::alerting::tests::RecordingSink;
    use crate::agent::config::AgentConfig;
    use crate::agent::dns_failover::tests::MockProvider;
    use crate::agent::dns_failover::DnsProviderClient;
    use crate::agent::config::DnsConfig;

    fn test_config(auto_failover: bool) -> AgentConfig {
        serde_json::from_value(json!({
            "instances": [{
                "uid": "cache-01",
                "name": "session-cache",
                "active_dc": "dc-a",
                "endpoints": {
                    "dc-a": {"host": "redis-a.internal", "port": 12000},
                    "dc-b": {"host": "redis-b.internal", "port": 12000}
                }
            }],
            "datacenters": {"dc-a": {"name": "dc-a"}, "dc-b": {"name": "dc-b"}},
            "auto_failover": auto_failover,
            "failover_provider": "none"
        }))
        .unwrap()
    }

    fn healthy_status() -> HealthStatus {
        let mut status = HealthStatus::default();
        status.status = HealthState::Healthy;
        status.can_serve_traffic = true;
        status.latency_ms = 20.0;
        status.memory_used_percent = 40.0;
        status.hit_rate = 0.95;
        status
    }

    fn failed_status(consecutive_errors: u32) -> HealthStatus {
        let mut status = HealthStatus::default();
        status.status = HealthState::Failed;
        status.can_serve_traffic = false;
        status.consecutive_errors = consecutive_errors;
        status
    }

    fn executor(provider: Arc<MockProvider>) -> DnsFailover {
        let config = DnsConfig {
            records: vec![crate::agent::config::DnsRecordConfig {
                name: "cache.example.com".to_string(),
                record_type: "CNAME".to_string(),
                ttl: 60,
                instance_uid: Some("cache-01".to_string()),
                instance_name: None,
            }],
            ..Default::default()
        };
        let provider: Arc<dyn DnsProviderClient> = provider;
        DnsFailover::new(config, provider)
    }

    fn manager(
        auto_failover: bool,
        provider: Arc<MockProvider>,
    ) -> (Arc<FailoverManager>, Arc<AgentContext>, Arc<RecordingSink>) {
        let context = AgentContext::new(test_config(auto_failover));
        let sink = RecordingSink::new();
        let manager = FailoverManager::new(
            context.clone(),
            Some(executor(provider)),
            sink.clone(),
            None,
            None,
        );
        (manager, context, sink)
    }

    #[test]
    fn test_replica_score_arithmetic() {
        // healthy, 20ms, 40% memory, 0.95 hit rate
        let score = replica_score(&healthy_status());
        assert!((score - 198.5).abs() < 1e-9);

        let mut degraded = healthy_status();
        degraded.status = HealthState::Degraded;
        degraded.consecutive_errors = 2;
        degraded.consecutive_anomalies = 1;
        // 50 + 40 + 30 + 28.5 - 20 - 5
        assert!((replica_score(&degraded) - 123.5).abs() < 1e-9);
    }

    #[test]
    fn test_best_alternative_skips_unserving_replicas() {
        let mut health = HashMap::new();
        health.insert("dc-a".to_string(), failed_status(1));
        health.insert("dc-b".to_string(), healthy_status());
        let mut failing = healthy_status();
        failing.can_serve_traffic = false;
        health.insert("dc-c".to_string(), failing);

        assert_eq!(find_best_alternative("dc-a", &health).as_deref(), Some("dc-b"));

        // No serving alternative at all
        let mut health = HashMap::new();
        health.insert("dc-a".to_string(), failed_status(1));
        health.insert("dc-b".to_string(), failed_status(1));
        assert!(find_best_alternative("dc-a", &health).is_none());
    }

    #[test]
    fn test_confidence_for_failed_active_with_cooldown_expired() {
        let now = now_epoch();
        let (confidence, reasons) = compute_confidence(
            &failed_status(4),
            &healthy_status(),
            "dc-a",
            "dc-b",
            now - 7200.0,
            now,
        );
        // 0.5 + 0.4 + 0.3 + 0.1 - 0.1, clamped to 1.0
        assert_eq!(confidence, 1.0);
        assert!(reasons.iter().any(|r| r.contains("has failed")));
    }

    #[test]
    fn test_confidence_with_recent_failover_penalty() {
        let mut active = HealthStatus::default();
        active.status = HealthState::Failing;
        active.can_serve_traffic = false;
        active.memory_used_percent = 97.0;
        active.latency_ms = 600.0;

        let mut target = healthy_status();
        target.status = HealthState::Degraded;

        let now = now_epoch();
        let (confidence, _) =
            compute_confidence(&active, &target, "dc-a", "dc-b", now - 1800.0, now);
        // 0.5 + 0.2 + 0.2 + 0.15 - 0.3
        assert!((confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_without_prior_failover_has_no_penalty() {
        let now = now_epoch();
        let (confidence, _) =
            compute_confidence(&failed_status(0), &healthy_status(), "dc-a", "dc-b", 0.0, now);
        // 0.5 + 0.4 + 0.1, clamped
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn test_consult_triggers() {
        let analysis = ClientErrorAnalysis::default();

        assert!(should_consult_advisor(&failed_status(0), &analysis));

        let mut errors = healthy_status();
        errors.consecutive_errors = 2;
        assert!(should_consult_advisor(&errors, &analysis));

        let mut anomalous = healthy_status();
        anomalous.is_anomaly = true;
        anomalous.anomaly_score = 0.75;
        assert!(should_consult_advisor(&anomalous, &analysis));

        let mut slow = healthy_status();
        slow.latency_ms = 250.0;
        assert!(should_consult_advisor(&slow, &analysis));

        let mut impacted = ClientErrorAnalysis::default();
        impacted.client_impact = ClientImpact::Medium;
        assert!(should_consult_advisor(&healthy_status(), &impacted));

        let mut noisy = ClientErrorAnalysis::default();
        noisy.error_count = 11;
        assert!(should_consult_advisor(&healthy_status(), &noisy));

        // A quiet healthy instance does not consult
        assert!(!should_consult_advisor(&healthy_status(), &analysis));
    }

    #[test]
    fn test_impact_classification() {
        assert_eq!(classify_impact(0.30, 0.10), "Significant improvement");
        assert_eq!(classify_impact(0.30, 0.20), "Slight improvement");
        assert_eq!(classify_impact(0.30, 0.50), "Situation worsened");
        assert_eq!(classify_impact(0.30, 0.35), "No significant change");
        assert_eq!(classify_impact(0.0, 0.0), "No significant change");
    }

    #[tokio::test]
    async fn test_healthy_active_takes_no_action() {
        let provider = MockProvider::new();
        let (manager, context, sink) = manager(true, provider.clone());
        context.update_health_status("cache-01", "dc-a", healthy_status());
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        assert!(sink.alerts.lock().is_empty());
        assert_eq!(*provider.upsert_count.lock(), 0);
        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-a"));
    }

    #[tokio::test]
    async fn test_failed_active_executes_failover() {
        let provider = MockProvider::new();
        let (manager, context, sink) = manager(true, provider.clone());
        context.update_health_status("cache-01", "dc-a", failed_status(4));
        context.update_health_status("cache-01", "dc-b", healthy_status());
        manager
            .last_failover_time
            .lock()
            .insert("cache-01".to_string(), now_epoch() - 7200.0);

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-b"));
        assert_eq!(sink.types(), vec!["failover_succeeded".to_string()]);

        let history = manager.decision_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].confidence, 1.0);
        assert_eq!(history[0].to_dc, "dc-b");
    }

    #[tokio::test]
    async fn test_low_confidence_requests_manual_intervention() {
        let provider = MockProvider::new();
        let (manager, context, sink) = manager(true, provider.clone());

        let mut active = HealthStatus::default();
        active.status = HealthState::Failing;
        active.can_serve_traffic = false;
        active.memory_used_percent = 97.0;
        active.latency_ms = 600.0;
        context.update_health_status("cache-01", "dc-a", active);

        let mut target = healthy_status();
        target.status = HealthState::Degraded;
        context.update_health_status("cache-01", "dc-b", target);

        manager
            .last_failover_time
            .lock()
            .insert("cache-01".to_string(), now_epoch() - 1800.0);

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        // 0.75 < 0.95: surfaced, not silently skipped
        assert_eq!(sink.types(), vec!["manual_failover_required".to_string()]);
        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-a"));
        assert_eq!(*provider.upsert_count.lock(), 0);
    }

    #[tokio::test]
    async fn test_auto_failover_disabled_requests_manual_intervention() {
        let provider = MockProvider::new();
        let (manager, context, sink) = manager(false, provider.clone());
        context.update_health_status("cache-01", "dc-a", failed_status(4));
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        assert_eq!(sink.types(), vec!["manual_failover_required".to_string()]);
        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-a"));
    }

    #[tokio::test]
    async fn test_failed_record_update_does_not_switch() {
        let provider = MockProvider::failing(&["cache.example.com"]);
        let (manager, context, sink) = manager(true, provider.clone());
        context.update_health_status("cache-01", "dc-a", failed_status(4));
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-a"));
        assert_eq!(sink.types(), vec!["failover_failed".to_string()]);
        assert!(manager.decision_history().is_empty());
    }

    #[tokio::test]
    async fn test_manual_failover_records_cooldown() {
        let provider = MockProvider::new();
        let (manager, context, sink) = manager(false, provider.clone());

        let ok = manager
            .perform_manual_failover("cache-01", "dc-b", Some("maintenance window".to_string()))
            .await;
        assert!(ok);
        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-b"));
        assert!(manager.last_failover("cache-01") > 0.0);
        assert_eq!(sink.types(), vec!["failover_succeeded".to_string()]);
    }

    struct ScriptedAdvisor {
        decision: AiDecision,
    }

    #[async_trait::async_trait]
    impl FailoverAdvisor for ScriptedAdvisor {
        async fn analyze_situation(&self, _request: AdvisorRequest<'_>) -> AiDecision {
            self.decision.clone()
        }
    }

    fn ai_failover_decision(target_dc: &str, confidence: f64) -> AiDecision {
        AiDecision {
            recommendation: Verdict::Failover,
            target_dc: Some(target_dc.to_string()),
            confidence,
            reason: "client errors corroborate server degradation".to_string(),
            potential_impact: Some("brief reconnects".to_string()),
            primary_indicators: vec!["latency_ms".to_string()],
        }
    }

    fn manager_with_advisor(
        decision: AiDecision,
        provider: Arc<MockProvider>,
    ) -> (Arc<FailoverManager>, Arc<AgentContext>, Arc<RecordingSink>) {
        let context = AgentContext::new(test_config(true));
        let sink = RecordingSink::new();
        let advisor: Arc<dyn FailoverAdvisor> = Arc::new(ScriptedAdvisor { decision });
        let manager = FailoverManager::new(
            context.clone(),
            Some(executor(provider)),
            sink.clone(),
            Some(advisor),
            None,
        );
        (manager, context, sink)
    }

    #[tokio::test]
    async fn test_single_ai_recommendation_does_not_execute() {
        let provider = MockProvider::new();
        let (manager, context, sink) =
            manager_with_advisor(ai_failover_decision("dc-b", 0.85), provider.clone());
        context.update_health_status("cache-01", "dc-a", failed_status(2));
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        // One verdict only: consistency gate fails, manual alert instead
        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-a"));
        assert_eq!(sink.types(), vec!["manual_failover_required".to_string()]);
    }

    #[tokio::test]
    async fn test_two_consistent_ai_recommendations_execute() {
        let provider = MockProvider::new();
        let (manager, context, sink) =
            manager_with_advisor(ai_failover_decision("dc-b", 0.85), provider.clone());
        context.update_health_status("cache-01", "dc-a", failed_status(2));
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;
        manager.check_instance(&instance).await;

        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-b"));
        let types = sink.types();
        assert_eq!(
            types,
            vec![
                "manual_failover_required".to_string(),
                "failover_succeeded".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_low_confidence_ai_recommendation_never_executes() {
        let provider = MockProvider::new();
        let (manager, context, _sink) =
            manager_with_advisor(ai_failover_decision("dc-b", 0.7), provider.clone());
        context.update_health_status("cache-01", "dc-a", failed_status(2));
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;
        manager.check_instance(&instance).await;
        manager.check_instance(&instance).await;

        assert_eq!(context.active_dc("cache-01").as_deref(), Some("dc-a"));
    }

    #[tokio::test]
    async fn test_ai_recommendation_ring_is_bounded() {
        let provider = MockProvider::new();
        let (manager, context, _sink) =
            manager_with_advisor(ai_failover_decision("dc-b", 0.7), provider);
        context.update_health_status("cache-01", "dc-a", failed_status(2));
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        for _ in 0..8 {
            manager.check_instance(&instance).await;
        }
        let recommendations = manager.ai_recommendations.lock();
        assert_eq!(recommendations["cache-01"].len(), AI_RECOMMENDATION_CAPACITY);
    }

    #[tokio::test]
    async fn test_post_failover_audit_alerts() {
        let provider = MockProvider::new();
        let (manager, _context, sink) = manager(true, provider);

        let mut pre = ClientErrorAnalysis::default();
        pre.error_rate = 0.30;
        pre.error_count = 30;
        let mut post = ClientErrorAnalysis::default();
        post.error_rate = 0.10;
        post.error_count = 10;

        manager.run_post_failover_audit("cache-01", &pre, &post).await;

        let alerts = sink.alerts.lock();
        assert_eq!(alerts[0].alert_type, "failover_impact");
        assert_eq!(alerts[0].severity, Severity::Info);
        assert_eq!(alerts[0].details["impact"], "Significant improvement");
        drop(alerts);

        let mut worse = ClientErrorAnalysis::default();
        worse.error_rate = 0.50;
        manager.run_post_failover_audit("cache-01", &pre, &worse).await;
        let alerts = sink.alerts.lock();
        assert_eq!(alerts[1].severity, Severity::Warning);
        assert_eq!(alerts[1].details["impact"], "Situation worsened");
    }

    #[tokio::test]
    async fn test_unprobed_active_takes_no_action() {
        let provider = MockProvider::new();
        let (manager, context, sink) = manager(true, provider.clone());
        // Only the alternative has been probed; the active replica still has
        // its initial unknown status and is assumed to serve traffic
        context.update_health_status("cache-01", "dc-b", healthy_status());

        let instance = context.config.instances[0].clone();
        manager.check_instance(&instance).await;

        assert!(sink.alerts.lock().is_empty());
        assert_eq!(*provider.upsert_count.lock(), 0);
    }
}
