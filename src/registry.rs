//! Registry access layer.
//!
//! The resolver talks to the service registry through the `RegistryClient`
//! capability so the refresh pipeline can be driven by an in-memory fake in
//! tests. The production implementation speaks the Consul HTTP API over a
//! shared `reqwest` client: raw KV reads plus the blocking health query that
//! long-polls until the watch index advances.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::node::ResolverError;

/// One healthy instance as reported by the registry's health endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthEntry {
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
}

/// The registry surface the resolver depends on.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetches the raw bytes stored under `key`.
    async fn kv_get(&self, key: &str) -> Result<Bytes, ResolverError>;

    /// Long-polls the health endpoint for `service`, returning the passing
    /// entries and the watch index to gate the next call. The registry blocks
    /// until the index advances past `wait_index` or `wait_time` elapses.
    async fn service_health(
        &self,
        service: &str,
        wait_index: u64,
        wait_time: Duration,
    ) -> Result<(Vec<HealthEntry>, u64), ResolverError>;
}

/// Consul HTTP API client.
pub struct ConsulClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConsulClient {
    /// Builds a client for the agent at `address` (e.g. `http://127.0.0.1:8500`).
    ///
    /// The HTTP client carries no overall request timeout: the health query
    /// is a deliberate long poll, bounded server-side by the `wait` parameter.
    pub fn new(address: &str) -> Result<Self, ResolverError> {
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| ResolverError::Registry(e.to_string()))?;
        Ok(Self { base_url: address.trim_end_matches('/').to_string(), client })
    }
}

#[derive(Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Service")]
    service: ConsulAgentService,
}

#[derive(Deserialize)]
struct ConsulAgentService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

pub(crate) fn parse_health_entries(body: &[u8]) -> Result<Vec<HealthEntry>, serde_json::Error> {
    let raw: Vec<ConsulHealthEntry> = serde_json::from_slice(body)?;
    Ok(raw
        .into_iter()
        .map(|e| HealthEntry {
            address: e.service.address,
            port: e.service.port,
            meta: e.service.meta,
        })
        .collect())
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn kv_get(&self, key: &str) -> Result<Bytes, ResolverError> {
        let url = format!("{}/v1/kv/{}?raw=1", self.base_url, key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolverError::Registry(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ResolverError::Registry(format!(
                "kv get '{}' returned status {}",
                key,
                resp.status()
            )));
        }
        let body = resp.bytes().await.map_err(|e| ResolverError::Registry(e.to_string()))?;
        debug!(key = %key, bytes = body.len(), "kv fetch complete");
        Ok(body)
    }

    async fn service_health(
        &self,
        service: &str,
        wait_index: u64,
        wait_time: Duration,
    ) -> Result<(Vec<HealthEntry>, u64), ResolverError> {
        let url = format!(
            "{}/v1/health/service/{}?passing=1&index={}&wait={}s",
            self.base_url,
            service,
            wait_index,
            wait_time.as_secs()
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolverError::Registry(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ResolverError::Registry(format!(
                "health query for '{}' returned status {}",
                service,
                resp.status()
            )));
        }

        let last_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(wait_index);

        let body = resp.bytes().await.map_err(|e| ResolverError::Registry(e.to_string()))?;
        let entries = parse_health_entries(&body)
            .map_err(|e| ResolverError::Registry(format!("health payload decode: {e}")))?;
        debug!(service = %service, entries = entries.len(), index = last_index, "health watch returned");
        Ok((entries, last_index))
    }
}
