//! Read-only HTTP API
//!
//! Exposes the agent's runtime state for dashboards and operators: health
//! statuses, recent metrics, failover decisions, and alert history. The API
//! never mutates agent state; failover itself is driven only by the decision
//! engine and the operator's configuration.

use std::sync::Arc;

use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{error, info};

use crate::agent::alerting::AlertManager;
use crate::agent::context::AgentContext;
use crate::agent::decision::FailoverManager;

pub struct ApiServer {
    pub context: Arc<AgentContext>,
    pub alerts: Arc<AlertManager>,
    pub failover: Arc<FailoverManager>,
}

impl ApiServer {
    pub fn new(
        context: Arc<AgentContext>,
        alerts: Arc<AlertManager>,
        failover: Arc<FailoverManager>,
    ) -> ApiServer {
        ApiServer {
            context,
            alerts,
            failover,
        }
    }

    /// Serve requests until the process exits. Runs on its own thread; all
    /// handlers read snapshots, so the control loops are never blocked.
    pub fn run(self) {
        let port = self.context.config.api.port;
        let server = match Server::http(("0.0.0.0", port)) {
            Ok(server) => server,
            Err(e) => {
                error!("failed to start API server on port {}: {}", port, e);
                return;
            }
        };
        info!("API server listening on port {}", port);

        for request in server.incoming_requests() {
            self.handle(request);
        }
    }

    fn authorized(&self, request: &Request) -> bool {
        let expected = match &self.context.config.api.api_key {
            Some(key) => key,
            None => return true,
        };
        request
            .headers()
            .iter()
            .find(|h| h.field.equiv("x-api-key"))
            .map(|h| h.value.as_str() == expected)
            .unwrap_or(false)
    }

    fn handle(&self, request: Request) {
        if *request.method() != Method::Get {
            respond(request, 405, json!({"error": "method not allowed"}));
            return;
        }
        if !self.authorized(&request) {
            respond(request, 401, json!({"error": "unauthorized"}));
            return;
        }

        let url = request.url().to_string();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (url, None),
        };

        match path.as_str() {
            "/api/v1/status" => self.handle_status(request),
            "/api/v1/health" => self.handle_health(request),
            "/api/v1/instances" => self.handle_instances(request),
            "/api/v1/decisions" => self.handle_decisions(request),
            "/api/v1/alerts" => self.handle_alerts(request),
            _ if path.starts_with("/api/v1/metrics/") => {
                let uid = path.trim_start_matches("/api/v1/metrics/").to_string();
                self.handle_metrics(request, &uid, query.as_deref());
            }
            _ => respond(request, 404, json!({"error": "not found"})),
        }
    }

    fn handle_status(&self, request: Request) {
        let body = json!({
            "status": "running",
            "uptime_seconds": self.context.uptime_seconds(),
            "instance_count": self.context.instances().len(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        respond(request, 200, body);
    }

    fn handle_health(&self, request: Request) {
        let snapshot = self.context.health_snapshot();
        respond(request, 200, json!(snapshot));
    }

    fn handle_instances(&self, request: Request) {
        let instances: Vec<_> = self
            .context
            .instances()
            .iter()
            .map(|instance| {
                json!({
                    "uid": instance.uid,
                    "name": instance.name,
                    "active_dc": self.context.active_dc(&instance.uid),
                    "datacenters": instance.endpoints.keys().collect::<Vec<_>>(),
                })
            })
            .collect();
        respond(request, 200, json!(instances));
    }

    fn handle_metrics(&self, request: Request, instance_uid: &str, query: Option<&str>) {
        let minutes = query
            .and_then(|q| {
                q.split('&')
                    .find_map(|pair| pair.strip_prefix("minutes=").map(str::to_string))
            })
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let samples = self.context.metrics.since(instance_uid, minutes);
        let latency = self
            .context
            .metrics
            .statistics(instance_uid, minutes, |s| s.latency_ms);
        respond(
            request,
            200,
            json!({
                "instance_uid": instance_uid,
                "window_minutes": minutes,
                "latency_ms": latency,
                "samples": samples,
            }),
        );
    }

    fn handle_decisions(&self, request: Request) {
        respond(request, 200, json!(self.failover.decision_history()));
    }

    fn handle_alerts(&self, request: Request) {
        let alerts = self.alerts.alert_history(100, None, None);
        respond(request, 200, json!(alerts));
    }
}

fn respond(request: Request, status: u16, body: serde_json::Value) {
    let payload = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    let response = Response::from_string(payload).with_status_code(status);
    let response = match Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(header) => response.with_header(header),
        Err(_) => response,
    };
    if let Err(e) = request.respond(response) {
        error!("failed to send API response: {}", e);
    }
}
