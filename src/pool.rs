//! The adaptive weighting engine.
//!
//! Each refresh turns the topology snapshot plus the tuning signals into a
//! fresh `CandidatePool`: the set of selectable nodes and their balance
//! factors. Local-zone nodes are always admitted; other zones join only when
//! cross-zone spill is enabled, and their factors stay near the floor until
//! the local zone is saturated. The per-node adjustment is a proportional
//! controller with a multiplicative step, clamped so a noisy signal cannot
//! run a factor away.
//!
//! Selection state (`weights`) lives on the pool but is driven by the
//! selector; everything else is immutable after publish.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

use crate::config_store::OnlineLab;
use crate::node::{ServiceNode, ServiceZone};
use crate::topology::TopologySnapshot;

pub const BALANCE_FACTOR_MAX_LOCAL: f64 = 3000.0;
pub const BALANCE_FACTOR_MIN_LOCAL: f64 = 200.0;
pub const BALANCE_FACTOR_MAX_CROSS: f64 = 1000.0;
pub const BALANCE_FACTOR_MIN_CROSS: f64 = 1.0;
pub const BALANCE_FACTOR_START_CROSS: f64 = 50.0;
pub const BALANCE_FACTOR_CROSS_RATE: f64 = 0.1;

/// The candidate set published by one refresh.
///
/// `nodes`, `factors` and the credit vector are parallel and equal-length;
/// `factor_sum` is the arithmetic sum of `factors`. Only the credits mutate
/// after publish, under their own lock.
#[derive(Debug, Default)]
pub struct CandidatePool {
    pub nodes: Vec<ServiceNode>,
    pub factors: Vec<f64>,
    pub factor_sum: f64,
    pub(crate) weights: Mutex<Vec<f64>>,
}

impl CandidatePool {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, mut node: ServiceNode, factor: f64, cache: &mut HashMap<String, f64>) {
        node.current_factor = factor;
        cache.insert(node.instance_id.clone(), factor);
        self.nodes.push(node);
        self.factors.push(factor);
        self.factor_sum += factor;
        self.weights.get_mut().push(0.0);
    }
}

/// `|node − zone| / 100 < rate_threshold`
pub fn node_balanced(node: &ServiceNode, zone: &ServiceZone, rate_threshold: f64) -> bool {
    (node.workload - zone.workload).abs() / 100.0 < rate_threshold
}

/// `|local − other| / 100 < rate_threshold * 2`
pub fn zone_balanced(local: &ServiceZone, other: &ServiceZone, rate_threshold: f64) -> bool {
    (local.workload - other.workload).abs() / 100.0 < rate_threshold * 2.0
}

/// Probabilistic full eviction of the balance-factor cache.
///
/// Draws a uniform integer in `[1, expire_cycles]`; on 1 the cache is cleared
/// in full. The expected cache lifetime is `expire_cycles` refresh cycles
/// with a memoryless distribution, so independent resolvers never go stale in
/// lockstep. Returns whether the cache was cleared.
pub fn maybe_evict_cache(
    rng: &mut impl Rng,
    cache: &mut HashMap<String, f64>,
    expire_cycles: i64,
) -> bool {
    let expire_cycles = expire_cycles.max(1);
    if rng.gen_range(1..=expire_cycles) == 1 {
        cache.clear();
        debug!("balance factor cache cleared");
        return true;
    }
    false
}

/// Builds the candidate pool for one refresh.
///
/// The local zone is processed first, then the remaining zones in snapshot
/// order when `lab.cross_zone` is set. `cache` is read for warm starts and
/// updated with every factor computed here.
pub fn build_candidate_pool(
    topo: &TopologySnapshot,
    lab: &OnlineLab,
    cpu_threshold: f64,
    zone_cpu_updated: bool,
    cache: &mut HashMap<String, f64>,
) -> CandidatePool {
    // Latched before the passes: inserts made below must not flip the
    // warm-start behavior for nodes later in the same build.
    let factor_cached = !cache.is_empty();
    let mut pool = CandidatePool::default();

    if let Some(local) = topo.local_zone() {
        let mut local_sum = 0.0;
        let mut local_count = 0usize;

        for node in &local.nodes {
            let mut bf = node.declared_factor;
            if factor_cached {
                if let Some(&cached) = cache.get(&node.instance_id) {
                    bf = cached;
                } else if local_count > 0 {
                    // A node joining a warm zone starts from its peers'
                    // average rather than its cold declared weight.
                    bf = local_sum / local_count as f64;
                } else {
                    bf = node.declared_factor * lab.factor_start_rate;
                }
            }
            if zone_cpu_updated && !node_balanced(node, local, lab.rate_threshold) {
                if node.workload > local.workload {
                    bf -= bf * lab.learning_rate;
                } else {
                    bf += bf * lab.learning_rate;
                }
            }
            bf = bf.clamp(BALANCE_FACTOR_MIN_LOCAL, BALANCE_FACTOR_MAX_LOCAL);
            debug!(instance = %node.instance_id, zone = %local.zone, factor = bf, "local candidate");
            local_sum += bf;
            local_count += 1;
            pool.push(node.clone(), bf, cache);
        }
    }

    if lab.cross_zone {
        for (i, zone) in topo.zones.iter().enumerate() {
            if Some(i) == topo.local {
                continue;
            }
            for node in &zone.nodes {
                let mut bf = node.declared_factor;
                if let Some(&cached) = cache.get(&node.instance_id) {
                    bf = cached;
                }

                // Spill opens only when the local zone is saturated past the
                // CPU threshold and measurably hotter than this zone. With no
                // local zone in the snapshot there is no signal, so no spill.
                let spill = topo.local_zone().is_some_and(|local| {
                    !zone_balanced(local, zone, lab.rate_threshold)
                        && local.workload > cpu_threshold
                        && local.workload > zone.workload
                });

                if spill {
                    bf *= BALANCE_FACTOR_CROSS_RATE;
                } else {
                    bf = BALANCE_FACTOR_MIN_CROSS;
                }

                if zone_cpu_updated {
                    if spill {
                        // Keep a freshly opened spill above the selector's
                        // quantisation noise before nudging it upward.
                        if bf < BALANCE_FACTOR_START_CROSS {
                            bf = BALANCE_FACTOR_START_CROSS;
                        }
                        bf += bf * lab.learning_rate;
                    } else {
                        bf -= bf * lab.learning_rate;
                    }
                    if !node_balanced(node, zone, lab.rate_threshold) {
                        if node.workload > zone.workload {
                            bf -= bf * lab.learning_rate;
                        } else {
                            bf += bf * lab.learning_rate;
                        }
                    }
                }
                bf = bf.clamp(BALANCE_FACTOR_MIN_CROSS, BALANCE_FACTOR_MAX_CROSS);
                debug!(instance = %node.instance_id, zone = %zone.zone, factor = bf, spill = spill, "cross-zone candidate");
                pool.push(node.clone(), bf, cache);
            }
        }
    }

    pool
}
