//! Agent configuration loading and validation
//!
//! Configuration is a single JSON document describing the monitored instances,
//! the datacenters they live in, and the external integrations (DNS provider,
//! Elasticsearch, Azure OpenAI, alert channels). Secrets may be supplied via
//! environment variables which override the file contents.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    #[display(fmt = "invalid configuration: {}", reason)]
    Invalid {
        #[error(not(source))]
        reason: String,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// A single datacenter endpoint for an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// A replicated Redis instance monitored across datacenters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Stable identifier, also used as the admin-API database id
    pub uid: String,
    /// Display name
    pub name: String,
    /// Datacenter name -> endpoint
    pub endpoints: HashMap<String, Endpoint>,
    /// Datacenter currently designated to receive traffic
    #[serde(default = "default_active_dc")]
    pub active_dc: String,
    /// Optional password, overridable via REDIS_PASSWORD_<uid>
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

fn default_active_dc() -> String {
    "primary".to_string()
}

/// Datacenter descriptor with an optional Redis Enterprise admin API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Datacenter {
    pub name: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_user: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_password: Option<String>,
}

/// DNS record template updated on failover
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecordConfig {
    pub name: String,
    #[serde(rename = "type", default = "default_record_type")]
    pub record_type: String,
    #[serde(default = "default_record_ttl")]
    pub ttl: u32,
    /// Instance this record belongs to; records without an instance are
    /// defaults applied to any instance that has no dedicated records
    #[serde(default)]
    pub instance_uid: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
}

fn default_record_type() -> String {
    "CNAME".to_string()
}

fn default_record_ttl() -> u32 {
    60
}

/// DNS provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Route53 hosted zone
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Cloud DNS project and zone
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub zone_name: Option<String>,
    #[serde(default, skip_serializing)]
    pub aws_access_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub aws_secret_key: Option<String>,
    #[serde(default)]
    pub aws_region: Option<String>,
    /// Bearer token for the Cloud DNS API
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    /// Records to rewrite on failover
    #[serde(default)]
    pub records: Vec<DnsRecordConfig>,
    /// Explicit instance -> datacenter -> hostname overrides
    #[serde(default)]
    pub endpoint_map: HashMap<String, HashMap<String, String>>,
    /// Suffix for synthesized hostnames (`<instance>.<dc>.<suffix>`)
    #[serde(default = "default_dns_suffix")]
    pub default_suffix: String,
}

fn default_dns_suffix() -> String {
    "example.com".to_string()
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            zone_id: None,
            project_id: None,
            zone_name: None,
            aws_access_key: None,
            aws_secret_key: None,
            aws_region: None,
            access_token: None,
            records: Vec::new(),
            endpoint_map: HashMap::new(),
            default_suffix: default_dns_suffix(),
        }
    }
}

/// Azure OpenAI advisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureOpenAiConfig {
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_external_timeout")]
    pub timeout_secs: u64,
}

fn default_openai_model() -> String {
    "gpt-4".to_string()
}

fn default_api_version() -> String {
    "2023-05-15".to_string()
}

fn default_external_timeout() -> u64 {
    30
}

impl Default for AzureOpenAiConfig {
    fn default() -> Self {
        AzureOpenAiConfig {
            api_key: None,
            endpoint: None,
            model: default_openai_model(),
            api_version: default_api_version(),
            timeout_secs: default_external_timeout(),
        }
    }
}

/// Elasticsearch client-log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElkConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_index_pattern")]
    pub index_pattern: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Restrict queries to client-side log sources
    #[serde(default = "default_true")]
    pub client_logs_only: bool,
    /// Restrict queries to error severities
    #[serde(default)]
    pub errors_only: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_external_timeout")]
    pub timeout_secs: u64,
}

fn default_index_pattern() -> String {
    "logstash-*".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_api_port() -> u16 {
    5380
}

fn default_true() -> bool {
    true
}

impl Default for ElkConfig {
    fn default() -> Self {
        ElkConfig {
            url: None,
            username: None,
            password: None,
            index_pattern: default_index_pattern(),
            cache_ttl: default_cache_ttl(),
            client_logs_only: true,
            errors_only: false,
            verify_ssl: true,
            timeout_secs: default_external_timeout(),
        }
    }
}

/// Read-only HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            enabled: true,
            port: 5380,
            api_key: None,
        }
    }
}

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub datacenters: HashMap<String, Datacenter>,

    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,
    #[serde(default = "default_decision_interval")]
    pub decision_interval: u64,

    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,

    #[serde(default)]
    pub auto_failover: bool,
    #[serde(default = "default_failover_provider")]
    pub failover_provider: String,
    #[serde(default = "default_confidence_threshold")]
    pub failover_confidence_threshold: f64,
    #[serde(default = "default_consecutive_threshold")]
    pub failover_consecutive_threshold: u32,
    #[serde(default = "default_ai_confidence")]
    pub ai_failover_confidence: f64,

    #[serde(default = "default_dns_provider")]
    pub dns_provider: String,
    #[serde(default)]
    pub dns_config: DnsConfig,

    #[serde(default)]
    pub alert_endpoints: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub use_azure_openai: bool,
    #[serde(default)]
    pub azure_openai: AzureOpenAiConfig,

    #[serde(default)]
    pub use_elk: bool,
    #[serde(default)]
    pub elk: ElkConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

fn default_monitoring_interval() -> u64 {
    30
}

fn default_decision_interval() -> u64 {
    60
}

fn default_model_path() -> String {
    "./models".to_string()
}

fn default_anomaly_threshold() -> f64 {
    0.8
}

fn default_failover_provider() -> String {
    "dns".to_string()
}

fn default_confidence_threshold() -> f64 {
    0.95
}

fn default_consecutive_threshold() -> u32 {
    3
}

fn default_ai_confidence() -> f64 {
    0.8
}

fn default_dns_provider() -> String {
    "route53".to_string()
}

impl AgentConfig {
    /// Load a configuration file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
        let raw = fs::read_to_string(path)?;
        let mut config: AgentConfig = serde_json::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay secrets from the process environment onto the file contents
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = env::var("AZURE_OPENAI_API_KEY") {
            self.azure_openai.api_key = Some(key);
        }
        if let Ok(endpoint) = env::var("AZURE_OPENAI_ENDPOINT") {
            self.azure_openai.endpoint = Some(endpoint);
        }

        if let Ok(url) = env::var("ELASTICSEARCH_URL") {
            self.elk.url = Some(url);
        }
        if let Ok(user) = env::var("ELASTICSEARCH_USERNAME") {
            self.elk.username = Some(user);
        }
        if let Ok(password) = env::var("ELASTICSEARCH_PASSWORD") {
            self.elk.password = Some(password);
        }

        if let Ok(key) = env::var("AWS_ACCESS_KEY_ID") {
            self.dns_config.aws_access_key = Some(key);
        }
        if let Ok(secret) = env::var("AWS_SECRET_ACCESS_KEY") {
            self.dns_config.aws_secret_key = Some(secret);
        }
        if let Ok(region) = env::var("AWS_REGION") {
            self.dns_config.aws_region = Some(region);
        }

        if let Ok(key) = env::var("API_KEY") {
            self.api.api_key = Some(key);
        }

        for instance in &mut self.instances {
            if let Ok(password) = env::var(format!("REDIS_PASSWORD_{}", instance.uid)) {
                instance.password = Some(password);
            }
        }
    }

    /// Structural validation; errors here are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(invalid("no instances configured"));
        }

        for instance in &self.instances {
            if instance.uid.is_empty() || instance.name.is_empty() {
                return Err(invalid(format!(
                    "instance '{}' is missing uid or name",
                    instance.name
                )));
            }
            if instance.endpoints.is_empty() {
                return Err(invalid(format!(
                    "instance '{}' has no endpoints",
                    instance.name
                )));
            }
            if !instance.endpoints.contains_key(&instance.active_dc) {
                return Err(invalid(format!(
                    "instance '{}' active_dc '{}' is not among its endpoints",
                    instance.name, instance.active_dc
                )));
            }
        }

        for (dc_name, dc) in &self.datacenters {
            if dc.name.is_empty() {
                return Err(invalid(format!("datacenter '{}' is missing a name", dc_name)));
            }
        }

        if self.use_azure_openai {
            if self.azure_openai.api_key.is_none() || self.azure_openai.endpoint.is_none() {
                return Err(invalid(
                    "use_azure_openai is set but azure_openai.api_key/endpoint are missing",
                ));
            }
        }

        if self.use_elk && self.elk.url.is_none() {
            return Err(invalid("use_elk is set but elk.url is missing"));
        }

        if self.failover_provider == "dns" {
            match self.dns_provider.as_str() {
                "route53" => {
                    if self.dns_config.zone_id.is_none() {
                        return Err(invalid("route53 provider requires dns_config.zone_id"));
                    }
                }
                "clouddns" => {
                    if self.dns_config.project_id.is_none() || self.dns_config.zone_name.is_none() {
                        return Err(invalid(
                            "clouddns provider requires dns_config.project_id and zone_name",
                        ));
                    }
                }
                other => {
                    return Err(invalid(format!("unsupported dns_provider '{}'", other)));
                }
            }
            if self.dns_config.records.is_empty() {
                return Err(invalid("dns_config.records is empty"));
            }
        } else if self.failover_provider != "none" {
            return Err(invalid(format!(
                "unsupported failover_provider '{}'",
                self.failover_provider
            )));
        }

        Ok(())
    }

    pub fn instance(&self, uid: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.uid == uid)
    }
}

fn invalid<S: Into<String>>(reason: S) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}
