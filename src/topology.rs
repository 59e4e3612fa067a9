//! Topology construction from registry health entries.
//!
//! Each refresh turns the raw health response into an immutable
//! `TopologySnapshot`: nodes grouped by availability zone, zone and node
//! workloads attached from the CPU telemetry maps, and the local zone
//! identified by string match against the resolver's own zone.

use std::collections::HashMap;
use tracing::debug;

use crate::node::{ServiceNode, ServiceZone};
use crate::registry::HealthEntry;

/// When an instance or zone is missing from the telemetry feed it is treated
/// as fully loaded, so unknown capacity never attracts extra traffic.
pub const UNKNOWN_WORKLOAD: f64 = 100.0;

/// Immutable per-refresh view of the service topology.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    /// Zones in first-appearance order of the registry response.
    pub zones: Vec<ServiceZone>,
    /// Index into `zones` of the resolver's own zone, when it has nodes.
    pub local: Option<usize>,
    /// Registry watch index observed with this snapshot.
    pub last_index: u64,
}

impl TopologySnapshot {
    pub fn local_zone(&self) -> Option<&ServiceZone> {
        self.local.map(|i| &self.zones[i])
    }

    pub fn node_count(&self) -> usize {
        self.zones.iter().map(|z| z.nodes.len()).sum()
    }
}

/// Groups health entries into zones and attaches workload telemetry.
///
/// Metadata contract per entry: `zone`, `instanceID`, `publicIP`, and
/// `balanceFactor` as a numeric string (unparseable values become 0, matching
/// the registration tooling's behavior of omitting the field).
pub fn build_topology(
    entries: &[HealthEntry],
    zone_cpu: &HashMap<String, f64>,
    instance_cpu: &HashMap<String, f64>,
    local_zone: &str,
    last_index: u64,
) -> TopologySnapshot {
    let mut zones: Vec<ServiceZone> = Vec::new();
    let mut zone_idx: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let meta = |k: &str| entry.meta.get(k).cloned().unwrap_or_default();
        let zone_name = meta("zone");
        let instance_id = meta("instanceID");
        let declared_factor =
            entry.meta.get("balanceFactor").and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);

        let node = ServiceNode {
            instance_id: instance_id.clone(),
            zone: zone_name.clone(),
            host: entry.address.clone(),
            port: entry.port,
            public_ip: meta("publicIP"),
            declared_factor,
            workload: instance_cpu.get(&instance_id).copied().unwrap_or(UNKNOWN_WORKLOAD),
            current_factor: 0.0,
        };

        let idx = *zone_idx.entry(zone_name.clone()).or_insert_with(|| {
            zones.push(ServiceZone {
                workload: zone_cpu.get(&zone_name).copied().unwrap_or(UNKNOWN_WORKLOAD),
                zone: zone_name.clone(),
                nodes: Vec::new(),
            });
            zones.len() - 1
        });
        debug!(
            zone = %zone_name,
            instance = %node.instance_id,
            workload = node.workload,
            declared = node.declared_factor,
            "topology node"
        );
        zones[idx].nodes.push(node);
    }

    let local = zones.iter().position(|z| z.zone == local_zone);
    TopologySnapshot { zones, local, last_index }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(zone: &str, id: &str, factor: &str, host: &str) -> HealthEntry {
        let mut meta = HashMap::new();
        meta.insert("zone".to_string(), zone.to_string());
        meta.insert("instanceID".to_string(), id.to_string());
        meta.insert("balanceFactor".to_string(), factor.to_string());
        meta.insert("publicIP".to_string(), format!("54.{host}"));
        HealthEntry { address: host.to_string(), port: 8080, meta }
    }

    #[test]
    fn test_groups_by_zone_in_first_appearance_order() {
        let entries = vec![
            entry("b", "i-1", "1000", "10.0.0.1"),
            entry("a", "i-2", "1000", "10.0.0.2"),
            entry("b", "i-3", "1000", "10.0.0.3"),
        ];
        let topo = build_topology(&entries, &HashMap::new(), &HashMap::new(), "a", 7);
        assert_eq!(topo.zones.len(), 2);
        assert_eq!(topo.zones[0].zone, "b");
        assert_eq!(topo.zones[0].nodes.len(), 2);
        assert_eq!(topo.zones[1].zone, "a");
        assert_eq!(topo.local, Some(1));
        assert_eq!(topo.last_index, 7);
        assert_eq!(topo.node_count(), 3);
    }

    #[test]
    fn test_workloads_attach_from_maps() {
        let entries = vec![entry("a", "i-1", "1000", "10.0.0.1")];
        let zone_cpu = HashMap::from([("a".to_string(), 37.0)]);
        let instance_cpu = HashMap::from([("i-1".to_string(), 21.0)]);
        let topo = build_topology(&entries, &zone_cpu, &instance_cpu, "a", 0);
        assert_eq!(topo.zones[0].workload, 37.0);
        assert_eq!(topo.zones[0].nodes[0].workload, 21.0);
    }

    #[test]
    fn test_missing_telemetry_defaults_to_full_load() {
        let entries = vec![entry("a", "i-unknown", "1000", "10.0.0.1")];
        let topo = build_topology(&entries, &HashMap::new(), &HashMap::new(), "a", 0);
        assert_eq!(topo.zones[0].workload, UNKNOWN_WORKLOAD);
        assert_eq!(topo.zones[0].nodes[0].workload, UNKNOWN_WORKLOAD);
    }

    #[test]
    fn test_unparseable_balance_factor_becomes_zero() {
        let entries = vec![entry("a", "i-1", "not-a-number", "10.0.0.1")];
        let topo = build_topology(&entries, &HashMap::new(), &HashMap::new(), "a", 0);
        assert_eq!(topo.zones[0].nodes[0].declared_factor, 0.0);
    }

    #[test]
    fn test_missing_meta_fields() {
        let entries = vec![HealthEntry { address: "10.0.0.9".into(), port: 80, meta: HashMap::new() }];
        let topo = build_topology(&entries, &HashMap::new(), &HashMap::new(), "a", 0);
        assert_eq!(topo.zones.len(), 1);
        assert_eq!(topo.zones[0].zone, "");
        assert!(topo.local.is_none());
        let node = &topo.zones[0].nodes[0];
        assert_eq!(node.declared_factor, 0.0);
        assert_eq!(node.instance_id, "");
    }

    #[test]
    fn test_local_zone_absent() {
        let entries = vec![entry("b", "i-1", "1000", "10.0.0.1")];
        let topo = build_topology(&entries, &HashMap::new(), &HashMap::new(), "a", 0);
        assert!(topo.local.is_none());
        assert!(topo.local_zone().is_none());
    }

    #[test]
    fn test_empty_entries() {
        let topo = build_topology(&[], &HashMap::new(), &HashMap::new(), "a", 3);
        assert!(topo.zones.is_empty());
        assert_eq!(topo.node_count(), 0);
        assert_eq!(topo.last_index, 3);
    }
}
