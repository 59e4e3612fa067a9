use serde::Deserialize;
use std::fs;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResolverConfig {
    pub registry: Option<RegistryConfig>,
    pub resolver: Option<ResolverSettings>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistryConfig {
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResolverSettings {
    pub service: Option<String>,
    pub cpu_threshold_key: Option<String>,
    pub zone_cpu_key: Option<String>,
    pub instance_factor_key: Option<String>,
    pub online_lab_key: Option<String>,
    pub refresh_interval_secs: Option<u64>,
    pub watch_timeout_secs: Option<u64>,
    pub zone_cpu_stale_secs: Option<u64>,
    /// Explicit local-zone override; when absent the cloud metadata probe runs.
    pub zone: Option<String>,
    /// One of `aws`, `aliyun`, `huawei`.
    pub cloud_provider: Option<String>,
}

pub const DEFAULT_REGISTRY_ADDR: &str = "http://127.0.0.1:8500";
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_ZONE_CPU_STALE_SECS: u64 = 300;

impl ResolverConfig {
    /// Applies defaults, validates, and sanitizes the configuration.
    ///
    /// After this call every field consumed by the resolver is present, so
    /// construction can unwrap the options without a second validation pass.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        let mut registry_cfg = self.registry.take().unwrap_or_default();
        registry_cfg.address =
            registry_cfg.address.or_else(|| Some(DEFAULT_REGISTRY_ADDR.to_string()));
        if registry_cfg.address.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::ConfigError("registry address must not be empty".to_string()));
        }
        self.registry = Some(registry_cfg);

        let mut resolver_cfg = self.resolver.take().unwrap_or_default();

        let service = resolver_cfg.service.take().unwrap_or_default();
        if service.trim().is_empty() {
            return Err(ConfigError::ConfigError("service name is required".to_string()));
        }
        resolver_cfg.service = Some(service);

        for (name, key) in [
            ("cpu_threshold_key", &resolver_cfg.cpu_threshold_key),
            ("zone_cpu_key", &resolver_cfg.zone_cpu_key),
            ("instance_factor_key", &resolver_cfg.instance_factor_key),
            ("online_lab_key", &resolver_cfg.online_lab_key),
        ] {
            match key {
                Some(k) if !k.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::ConfigError(format!("{name} is required")));
                }
            }
        }

        resolver_cfg.refresh_interval_secs = Some(
            resolver_cfg.refresh_interval_secs.unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS).max(1),
        );
        resolver_cfg.watch_timeout_secs =
            Some(resolver_cfg.watch_timeout_secs.unwrap_or(DEFAULT_WATCH_TIMEOUT_SECS).max(1));
        resolver_cfg.zone_cpu_stale_secs =
            Some(resolver_cfg.zone_cpu_stale_secs.unwrap_or(DEFAULT_ZONE_CPU_STALE_SECS).max(1));

        if let Some(provider) = resolver_cfg.cloud_provider.as_deref() {
            if !matches!(provider, "aws" | "aliyun" | "huawei") {
                return Err(ConfigError::ConfigError(format!(
                    "unknown cloud_provider '{provider}' (expected aws, aliyun or huawei)"
                )));
            }
        }

        self.resolver = Some(resolver_cfg);
        Ok(self)
    }
}

pub fn try_load_config(path: &str) -> Result<Option<ResolverConfig>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ResolverConfig>(&raw) {
            Ok(cfg) => {
                info!(path = %path, "Loaded config");
                Ok(Some(cfg))
            }
            Err(e) => Err(ConfigError::ConfigError(e.to_string())),
        },
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                info!(path = %path, "No config file found, using defaults");
                Ok(None)
            } else {
                Err(ConfigError::ConfigError(e.to_string()))
            }
        }
    }
}
