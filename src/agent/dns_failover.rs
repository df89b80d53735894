//! DNS-based failover execution
//!
//! Rewrites the routing records for an instance so client traffic lands in a
//! different datacenter. Record updates are idempotent UPSERTs against a
//! pluggable provider; a failover only succeeds when every record updates,
//! and the active datacenter is never switched on a partial failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use derive_more::{Display, Error, From};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::agent::config::{DnsConfig, DnsRecordConfig, Instance};

#[derive(Debug, Display, From, Error)]
pub enum ProviderError {
    Http(reqwest::Error),
    #[display(fmt = "provider returned status {}: {}", status, body)]
    Rejected {
        #[error(not(source))]
        status: u16,
        body: String,
    },
    #[display(fmt = "provider misconfigured: {}", _0)]
    Misconfigured(#[error(not(source))] String),
}

#[derive(Debug, Display, From, Error)]
pub enum FailoverError {
    #[display(fmt = "no DNS records configured for instance {}", _0)]
    NoRecords(#[error(not(source))] String),
    #[display(fmt = "record {} failed: {}", record, source)]
    RecordUpdate {
        #[error(not(source))]
        record: String,
        source: ProviderError,
    },
}

type Result<T> = std::result::Result<T, ProviderError>;

/// A provider capable of idempotently upserting one routing record
#[async_trait]
pub trait DnsProviderClient: Send + Sync {
    async fn upsert_record(
        &self,
        record_name: &str,
        record_type: &str,
        ttl: u32,
        value: &str,
    ) -> Result<()>;
}

fn ensure_trailing_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| ProviderError::Misconfigured("invalid signing key".to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// AWS signature v4 signing key derivation
fn sigv4_signing_key(secret: &str, datestamp: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let key = hmac_sha256(format!("AWS4{}", secret).as_bytes(), datestamp.as_bytes())?;
    let key = hmac_sha256(&key, region.as_bytes())?;
    let key = hmac_sha256(&key, service.as_bytes())?;
    hmac_sha256(&key, b"aws4_request")
}

/// Route53 provider: signed UPSERTs against a hosted zone
pub struct Route53Provider {
    zone_id: String,
    access_key: String,
    secret_key: String,
    region: String,
    client: reqwest::Client,
}

const ROUTE53_HOST: &str = "route53.amazonaws.com";

impl Route53Provider {
    pub fn from_config(config: &DnsConfig) -> Result<Route53Provider> {
        let zone_id = config
            .zone_id
            .clone()
            .ok_or_else(|| ProviderError::Misconfigured("zone_id is required".to_string()))?;
        let access_key = config.aws_access_key.clone().ok_or_else(|| {
            ProviderError::Misconfigured("aws_access_key is required".to_string())
        })?;
        let secret_key = config.aws_secret_key.clone().ok_or_else(|| {
            ProviderError::Misconfigured("aws_secret_key is required".to_string())
        })?;

        Ok(Route53Provider {
            zone_id,
            access_key,
            secret_key,
            region: config
                .aws_region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        })
    }

    fn change_batch_body(record_name: &str, record_type: &str, ttl: u32, value: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ChangeResourceRecordSetsRequest xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
  <ChangeBatch>
    <Changes>
      <Change>
        <Action>UPSERT</Action>
        <ResourceRecordSet>
          <Name>{}</Name>
          <Type>{}</Type>
          <TTL>{}</TTL>
          <ResourceRecords>
            <ResourceRecord>
              <Value>{}</Value>
            </ResourceRecord>
          </ResourceRecords>
        </ResourceRecordSet>
      </Change>
    </Changes>
  </ChangeBatch>
</ChangeResourceRecordSetsRequest>"#,
            record_name, record_type, ttl, value
        )
    }

    /// Build the signature v4 authorization header for one request
    fn authorization(
        &self,
        method: &str,
        canonical_uri: &str,
        amz_date: &str,
        datestamp: &str,
        payload: &str,
    ) -> Result<String> {
        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", ROUTE53_HOST, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = hex::encode(Sha256::digest(payload.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/route53/aws4_request", datestamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key =
            sigv4_signing_key(&self.secret_key, datestamp, &self.region, "route53")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        ))
    }
}

#[async_trait]
impl DnsProviderClient for Route53Provider {
    async fn upsert_record(
        &self,
        record_name: &str,
        record_type: &str,
        ttl: u32,
        value: &str,
    ) -> Result<()> {
        // Route53 requires fully qualified names
        let record_name = ensure_trailing_dot(record_name);
        let value = if record_type == "CNAME" {
            ensure_trailing_dot(value)
        } else {
            value.to_string()
        };

        let canonical_uri = format!("/2013-04-01/hostedzone/{}/rrset/", self.zone_id);
        let body = Self::change_batch_body(&record_name, record_type, ttl, &value);

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let authorization =
            self.authorization("POST", &canonical_uri, &amz_date, &datestamp, &body)?;

        let response = self
            .client
            .post(format!("https://{}{}", ROUTE53_HOST, canonical_uri))
            .header("Host", ROUTE53_HOST)
            .header("X-Amz-Date", amz_date)
            .header("Authorization", authorization)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!("route53 upsert applied for {}", record_name);
        Ok(())
    }
}

/// Cloud DNS provider: rrset patch with create-on-missing
pub struct CloudDnsProvider {
    project_id: String,
    zone_name: String,
    access_token: String,
    client: reqwest::Client,
}

impl CloudDnsProvider {
    pub fn from_config(config: &DnsConfig) -> Result<CloudDnsProvider> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| ProviderError::Misconfigured("project_id is required".to_string()))?;
        let zone_name = config
            .zone_name
            .clone()
            .ok_or_else(|| ProviderError::Misconfigured("zone_name is required".to_string()))?;
        let access_token = config.access_token.clone().ok_or_else(|| {
            ProviderError::Misconfigured("access_token is required".to_string())
        })?;

        Ok(CloudDnsProvider {
            project_id,
            zone_name,
            access_token,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        })
    }

    fn rrset_url(&self, record_name: &str, record_type: &str) -> String {
        format!(
            "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}/rrsets/{}/{}",
            self.project_id, self.zone_name, record_name, record_type
        )
    }

    fn changes_url(&self) -> String {
        format!(
            "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}/changes",
            self.project_id, self.zone_name
        )
    }
}

#[async_trait]
impl DnsProviderClient for CloudDnsProvider {
    async fn upsert_record(
        &self,
        record_name: &str,
        record_type: &str,
        ttl: u32,
        value: &str,
    ) -> Result<()> {
        let record_name = ensure_trailing_dot(record_name);
        let value = ensure_trailing_dot(value);
        let rrset = serde_json::json!({
            "name": record_name,
            "type": record_type,
            "ttl": ttl,
            "rrdatas": [value],
        });

        // Patch the existing record set, falling back to creation
        let response = self
            .client
            .patch(self.rrset_url(&record_name, record_type))
            .bearer_auth(&self.access_token)
            .json(&rrset)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!("cloud dns patch applied for {}", record_name);
            return Ok(());
        }

        if status.as_u16() == 404 {
            let created = self
                .client
                .post(self.changes_url())
                .bearer_auth(&self.access_token)
                .json(&serde_json::json!({"additions": [rrset]}))
                .send()
                .await?;
            let created_status = created.status();
            if created_status.is_success() {
                info!("cloud dns record created for {}", record_name);
                return Ok(());
            }
            let body = created.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: created_status.as_u16(),
                body,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Build the configured provider
pub fn create_provider(
    provider: &str,
    config: &DnsConfig,
) -> Result<Arc<dyn DnsProviderClient>> {
    match provider {
        "route53" => Ok(Arc::new(Route53Provider::from_config(config)?)),
        "clouddns" => Ok(Arc::new(CloudDnsProvider::from_config(config)?)),
        other => Err(ProviderError::Misconfigured(format!(
            "unsupported dns_provider '{}'",
            other
        ))),
    }
}

/// The DNS failover executor
pub struct DnsFailover {
    config: DnsConfig,
    provider: Arc<dyn DnsProviderClient>,
}

impl DnsFailover {
    pub fn new(config: DnsConfig, provider: Arc<dyn DnsProviderClient>) -> DnsFailover {
        DnsFailover { config, provider }
    }

    /// Records to rewrite for an instance. Instance-scoped records take
    /// precedence; otherwise default records are copied and tagged with the
    /// instance identifiers.
    pub fn records_for_instance(&self, instance_uid: &str, instance_name: &str) -> Vec<DnsRecordConfig> {
        let scoped: Vec<DnsRecordConfig> = self
            .config
            .records
            .iter()
            .filter(|r| {
                r.instance_uid.as_deref() == Some(instance_uid)
                    || r.instance_name.as_deref() == Some(instance_name)
            })
            .cloned()
            .collect();
        if !scoped.is_empty() {
            return scoped;
        }

        self.config
            .records
            .iter()
            .filter(|r| r.instance_uid.is_none() && r.instance_name.is_none())
            .map(|r| {
                let mut record = r.clone();
                record.instance_uid = Some(instance_uid.to_string());
                record.instance_name = Some(instance_name.to_string());
                record
            })
            .collect()
    }

    /// Resolve the hostname traffic should land on in the target datacenter
    pub fn target_hostname(&self, instance: &Instance, dc_name: &str) -> String {
        if let Some(endpoint) = instance.endpoints.get(dc_name) {
            return endpoint.host.clone();
        }

        if let Some(host) = self
            .config
            .endpoint_map
            .get(&instance.uid)
            .and_then(|dcs| dcs.get(dc_name))
        {
            return host.clone();
        }

        format!("{}.{}.{}", instance.name, dc_name, self.config.default_suffix)
    }

    /// Rewrite every record for the instance to point at the target
    /// datacenter. Succeeds only if all records update.
    pub async fn perform_failover(
        &self,
        instance: &Instance,
        from_dc: &str,
        to_dc: &str,
    ) -> std::result::Result<(), FailoverError> {
        let records = self.records_for_instance(&instance.uid, &instance.name);
        if records.is_empty() {
            error!("no DNS records configured for instance {}", instance.uid);
            return Err(FailoverError::NoRecords(instance.uid.clone()));
        }

        let target = self.target_hostname(instance, to_dc);
        info!(
            "rerouting {} from {} to {} ({} records -> {})",
            instance.name,
            from_dc,
            to_dc,
            records.len(),
            target
        );

        for record in &records {
            match self
                .provider
                .upsert_record(&record.name, &record.record_type, record.ttl, &target)
                .await
            {
                Ok(()) => {
                    info!("updated DNS record {} -> {}", record.name, target);
                }
                Err(source) => {
                    error!("failed to update DNS record {}: {}", record.name, source);
                    return Err(FailoverError::RecordUpdate {
                        record: record.name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }
}
