//! Decoding of the four tuning payloads distributed through the registry KV.
//!
//! Each payload is a small JSON document maintained out-of-band (capacity
//! planners push zone and instance CPU telemetry; the online lab pushes the
//! hyperparameters). A decode failure aborts the whole refresh cycle, so the
//! helpers here return the offending key alongside the serde error.

use serde::Deserialize;
use std::collections::HashMap;

use crate::node::ResolverError;

/// Hyperparameters consumed by the weighting engine on every refresh.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OnlineLab {
    pub cross_zone: bool,
    /// Decoded and carried for operators; the engine does not consult it.
    pub cross_zone_rate: f64,
    /// Inverse eviction probability of the balance-factor cache, in cycles.
    pub factor_cache_expire: i64,
    /// Warm-start multiplier applied to a node's declared factor.
    pub factor_start_rate: f64,
    /// Multiplicative step size of the per-node nudge.
    pub learning_rate: f64,
    /// Balance tolerance of the workload predicates.
    pub rate_threshold: f64,
}

impl Default for OnlineLab {
    fn default() -> Self {
        Self {
            cross_zone: false,
            cross_zone_rate: 0.0,
            factor_cache_expire: 1,
            factor_start_rate: 1.0,
            learning_rate: 0.1,
            rate_threshold: 0.1,
        }
    }
}

impl OnlineLab {
    /// Clamps every field into its documented domain. Operators fat-finger
    /// these values in the KV store; a zero or negative learning rate must
    /// not freeze or invert the control loop.
    pub fn sanitized(mut self) -> Self {
        self.factor_cache_expire = self.factor_cache_expire.max(1);
        if !(self.factor_start_rate > 0.0 && self.factor_start_rate <= 1.0) {
            self.factor_start_rate = 1.0;
        }
        if self.learning_rate <= 0.0 {
            self.learning_rate = OnlineLab::default().learning_rate;
        }
        if !(self.rate_threshold > 0.0 && self.rate_threshold <= 1.0) {
            self.rate_threshold = OnlineLab::default().rate_threshold;
        }
        self
    }
}

#[derive(Debug, Deserialize)]
struct CpuThreshold {
    #[serde(rename = "cpuThreshold")]
    cpu_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct ZoneCpuPayload {
    #[serde(default)]
    updated: i64,
    #[serde(default)]
    data: Vec<HashMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct InstanceFactorPayload {
    #[serde(default)]
    updated: i64,
    #[serde(default)]
    data: Vec<InstanceMetaInfo>,
}

#[derive(Debug, Deserialize)]
struct InstanceMetaInfo {
    #[serde(rename = "instanceid", default)]
    instance_id: String,
    #[serde(rename = "CPUUtilization", default)]
    cpu_utilization: f64,
}

fn decode_error(key: &str, source: serde_json::Error) -> ResolverError {
    ResolverError::ConfigDecode { key: key.to_string(), source }
}

/// Decodes the `{"cpuThreshold": <f64>}` payload.
pub fn decode_cpu_threshold(key: &str, body: &[u8]) -> Result<f64, ResolverError> {
    let ct: CpuThreshold = serde_json::from_slice(body).map_err(|e| decode_error(key, e))?;
    Ok(ct.cpu_threshold)
}

/// Decodes the zone CPU payload into `(updated, zone -> cpu)`.
pub fn decode_zone_cpu(key: &str, body: &[u8]) -> Result<(i64, HashMap<String, f64>), ResolverError> {
    let zc: ZoneCpuPayload = serde_json::from_slice(body).map_err(|e| decode_error(key, e))?;
    let mut map = HashMap::new();
    for entry in zc.data {
        for (zone, cpu) in entry {
            map.insert(zone, cpu);
        }
    }
    Ok((zc.updated, map))
}

/// Decodes the instance factor payload into `(updated, instance_id -> cpu)`.
pub fn decode_instance_factors(
    key: &str,
    body: &[u8],
) -> Result<(i64, HashMap<String, f64>), ResolverError> {
    let payload: InstanceFactorPayload =
        serde_json::from_slice(body).map_err(|e| decode_error(key, e))?;
    let map = payload
        .data
        .into_iter()
        .map(|info| (info.instance_id, info.cpu_utilization))
        .collect();
    Ok((payload.updated, map))
}

/// Decodes and sanitizes the online-lab hyperparameters.
pub fn decode_online_lab(key: &str, body: &[u8]) -> Result<OnlineLab, ResolverError> {
    let lab: OnlineLab = serde_json::from_slice(body).map_err(|e| decode_error(key, e))?;
    Ok(lab.sanitized())
}

/// Freshness gate for the zone CPU signal: the weighting engine only acts on
/// the telemetry when its `updated` stamp is recent enough.
pub fn zone_cpu_fresh(updated: i64, now_epoch: i64, stale_secs: u64) -> bool {
    updated > 0 && now_epoch.saturating_sub(updated) <= stale_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_cpu_threshold() {
        let v = decode_cpu_threshold("k", br#"{"cpuThreshold": 70.5}"#).unwrap();
        assert_eq!(v, 70.5);
    }

    #[test]
    fn test_decode_cpu_threshold_malformed() {
        let err = decode_cpu_threshold("lb/cpu", br#"{"cpuThreshold": "oops"}"#).unwrap_err();
        assert!(matches!(err, ResolverError::ConfigDecode { ref key, .. } if key == "lb/cpu"));
    }

    #[test]
    fn test_decode_zone_cpu() {
        let body = br#"{"updated": 1700000000, "data": [{"us-east-1a": 42.0}, {"us-east-1b": 61.5}]}"#;
        let (updated, map) = decode_zone_cpu("k", body).unwrap();
        assert_eq!(updated, 1_700_000_000);
        assert_eq!(map["us-east-1a"], 42.0);
        assert_eq!(map["us-east-1b"], 61.5);
    }

    #[test]
    fn test_decode_zone_cpu_empty_data() {
        let (updated, map) = decode_zone_cpu("k", br#"{"updated": 0, "data": []}"#).unwrap();
        assert_eq!(updated, 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_decode_instance_factors() {
        let body = br#"{
            "updated": 1700000100,
            "data": [
                {"public_ip": "54.0.0.1", "instanceid": "i-abc", "CPUUtilization": 55.0, "zone": "us-east-1a"},
                {"public_ip": "54.0.0.2", "instanceid": "i-def", "CPUUtilization": 12.5, "zone": "us-east-1b"}
            ]
        }"#;
        let (updated, map) = decode_instance_factors("k", body).unwrap();
        assert_eq!(updated, 1_700_000_100);
        assert_eq!(map["i-abc"], 55.0);
        assert_eq!(map["i-def"], 12.5);
    }

    #[test]
    fn test_decode_online_lab() {
        let body = br#"{
            "crossZone": true,
            "crossZoneRate": 0.3,
            "factorCacheExpire": 100,
            "factorStartRate": 0.5,
            "learningRate": 0.2,
            "rateThreshold": 0.1
        }"#;
        let lab = decode_online_lab("k", body).unwrap();
        assert!(lab.cross_zone);
        assert_eq!(lab.cross_zone_rate, 0.3);
        assert_eq!(lab.factor_cache_expire, 100);
        assert_eq!(lab.factor_start_rate, 0.5);
        assert_eq!(lab.learning_rate, 0.2);
        assert_eq!(lab.rate_threshold, 0.1);
    }

    #[test]
    fn test_online_lab_sanitized_clamps_out_of_range() {
        let lab = OnlineLab {
            cross_zone: true,
            cross_zone_rate: 0.0,
            factor_cache_expire: 0,
            factor_start_rate: 1.5,
            learning_rate: -0.2,
            rate_threshold: 0.0,
        }
        .sanitized();
        assert_eq!(lab.factor_cache_expire, 1);
        assert_eq!(lab.factor_start_rate, 1.0);
        assert_eq!(lab.learning_rate, OnlineLab::default().learning_rate);
        assert_eq!(lab.rate_threshold, OnlineLab::default().rate_threshold);
    }

    #[test]
    fn test_decode_online_lab_malformed_aborts() {
        let err = decode_online_lab("lb/lab", b"not json").unwrap_err();
        assert!(matches!(err, ResolverError::ConfigDecode { ref key, .. } if key == "lb/lab"));
    }

    #[test]
    fn test_zone_cpu_fresh() {
        assert!(zone_cpu_fresh(1_000, 1_100, 300));
        assert!(zone_cpu_fresh(1_000, 1_300, 300));
        assert!(!zone_cpu_fresh(1_000, 1_301, 300));
        // An unset stamp never counts as fresh.
        assert!(!zone_cpu_fresh(0, 1_000, 300));
        assert!(!zone_cpu_fresh(-5, 1_000, 300));
    }
}
