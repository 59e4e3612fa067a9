//! This module defines the core data structures for the resolver.
//!
//! It contains the `ServiceNode` and `ServiceZone` structs, which describe
//! the backend topology as reported by the registry, and the `ResolverError`
//! enum for all error conditions surfaced by the crate.

use crate::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("registry request failed: {0}")]
    Registry(String),
    #[error("malformed payload at key '{key}': {source}")]
    ConfigDecode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ConfigError> for ResolverError {
    fn from(err: ConfigError) -> Self {
        ResolverError::Config(err.to_string())
    }
}

/// A reachable backend instance of the resolved service.
///
/// `declared_factor` is the static weight the instance registered with;
/// `current_factor` is the adaptive weight computed on the last refresh.
/// `workload` is the last observed CPU utilisation in `[0, 100]` and defaults
/// to 100 when the telemetry feed has no entry for the instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceNode {
    pub instance_id: String,
    pub zone: String,
    pub host: String,
    pub port: u16,
    pub public_ip: String,
    pub declared_factor: f64,
    pub workload: f64,
    pub current_factor: f64,
}

/// All nodes of the service that live in one availability zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceZone {
    pub zone: String,
    pub nodes: Vec<ServiceNode>,
    /// Zone-level CPU utilisation in `[0, 100]`; 100 when unknown.
    pub workload: f64,
}

/// In-process selection counters, readable as a snapshot via
/// [`crate::resolver::ZoneResolver::metric`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverMetric {
    /// Number of candidates in the currently published pool.
    pub candidate_pool_size: usize,
    /// Selections that landed outside the local zone.
    pub cross_zone_selects: u64,
    /// Total selections served.
    pub total_selects: u64,
}
