//! Shared agent state
//!
//! `AgentContext` holds the configuration and the runtime state shared by the
//! probe, training, and decision loops: the health table, the metrics store,
//! and the authoritative active-datacenter assignment per instance. All reads
//! hand out copies so callers never observe a half-updated table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::agent::config::{AgentConfig, Instance};
use crate::agent::health::{HealthState, HealthStatus};
use crate::agent::metrics::MetricsStore;

pub struct AgentContext {
    pub config: AgentConfig,
    pub metrics: Arc<MetricsStore>,
    /// instance uid -> datacenter -> latest health status
    health: RwLock<HashMap<String, HashMap<String, HealthStatus>>>,
    /// instance uid -> active datacenter; the agent is the runtime authority
    active_dc: RwLock<HashMap<String, String>>,
    pub start_time: Instant,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Arc<AgentContext> {
        let mut health = HashMap::new();
        let mut active_dc = HashMap::new();

        for instance in &config.instances {
            let mut per_dc = HashMap::new();
            for dc_name in instance.endpoints.keys() {
                per_dc.insert(dc_name.clone(), HealthStatus::default());
            }
            health.insert(instance.uid.clone(), per_dc);
            active_dc.insert(instance.uid.clone(), instance.active_dc.clone());
        }

        Arc::new(AgentContext {
            config,
            metrics: Arc::new(MetricsStore::new()),
            health: RwLock::new(health),
            active_dc: RwLock::new(active_dc),
            start_time: Instant::now(),
        })
    }

    /// Replace the health status for one replica atomically
    pub fn update_health_status(&self, instance_uid: &str, dc_name: &str, status: HealthStatus) {
        let mut health = self.health.write();
        if let Some(per_dc) = health.get_mut(instance_uid) {
            if let Some(slot) = per_dc.get_mut(dc_name) {
                if matches!(status.status, HealthState::Failing | HealthState::Failed) {
                    warn!(
                        "instance {} in datacenter {} is {}: {}",
                        instance_uid,
                        dc_name,
                        status.status.as_str(),
                        status.error_message.as_deref().unwrap_or("-")
                    );
                }
                *slot = status;
            }
        }
    }

    /// Copy of the full health table
    pub fn health_snapshot(&self) -> HashMap<String, HashMap<String, HealthStatus>> {
        self.health.read().clone()
    }

    /// Copy of one instance's health per datacenter
    pub fn instance_health(&self, instance_uid: &str) -> HashMap<String, HealthStatus> {
        self.health
            .read()
            .get(instance_uid)
            .cloned()
            .unwrap_or_default()
    }

    /// Previous status for one replica, if any probe has run
    pub fn replica_health(&self, instance_uid: &str, dc_name: &str) -> Option<HealthStatus> {
        self.health
            .read()
            .get(instance_uid)
            .and_then(|per_dc| per_dc.get(dc_name))
            .cloned()
    }

    pub fn active_dc(&self, instance_uid: &str) -> Option<String> {
        self.active_dc.read().get(instance_uid).cloned()
    }

    /// Switch the active datacenter for an instance. The target must name a
    /// datacenter present in the instance's endpoints.
    pub fn switch_active_dc(&self, instance_uid: &str, new_active_dc: &str) -> bool {
        let valid = self
            .config
            .instance(instance_uid)
            .map(|i| i.endpoints.contains_key(new_active_dc))
            .unwrap_or(false);
        if !valid {
            warn!(
                "refusing to switch instance {} to unknown datacenter {}",
                instance_uid, new_active_dc
            );
            return false;
        }

        info!(
            "switching active DC for instance {} to {}",
            instance_uid, new_active_dc
        );
        self.active_dc
            .write()
            .insert(instance_uid.to_string(), new_active_dc.to_string());
        true
    }

    pub fn instances(&self) -> &[Instance] {
        &self.config.instances
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
