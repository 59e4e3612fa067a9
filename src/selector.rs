//! Smooth weighted round-robin over the published candidate pool.
//!
//! The selection logic is deliberately decoupled from the refresh pipeline:
//! the pool handle is swapped wholesale by the refresh task under the writer
//! lock, while callers take the reader lock only long enough to clone the
//! `Arc` and then run the round-robin under the pool's own credit lock. A
//! selection concurrent with a publish sees either the old or the new pool
//! in its entirety, never a mix.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

use crate::node::{ResolverMetric, ServiceNode};
use crate::pool::CandidatePool;
use crate::utils::metrics::{CANDIDATE_POOL_SIZE, CROSS_ZONE_SELECTS_TOTAL, SELECTS_TOTAL};

pub struct Selector {
    pool: RwLock<Arc<CandidatePool>>,
    metric: Mutex<ResolverMetric>,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(Arc::new(CandidatePool::default())),
            metric: Mutex::new(ResolverMetric::default()),
        }
    }

    /// Atomically replaces the published pool.
    pub fn publish(&self, pool: CandidatePool) {
        let size = pool.len();
        {
            let mut guard = self.pool.write();
            *guard = Arc::new(pool);
            self.metric.lock().candidate_pool_size = size;
        }
        CANDIDATE_POOL_SIZE.set(size as i64);
        debug!(candidate_pool_size = size, "candidate pool published");
    }

    /// Picks the next node, or `None` while the pool is empty.
    pub fn select(&self, local_zone: &str) -> Option<ServiceNode> {
        let pool = self.pool.read().clone();
        let idx = smooth_wrr_pick(&pool)?;
        let node = pool.nodes[idx].clone();

        let cross = node.zone != local_zone;
        {
            let mut metric = self.metric.lock();
            metric.total_selects += 1;
            if cross {
                metric.cross_zone_selects += 1;
            }
        }
        SELECTS_TOTAL.inc();
        if cross {
            CROSS_ZONE_SELECTS_TOTAL.inc();
        }
        Some(node)
    }

    pub fn metric(&self) -> ResolverMetric {
        *self.metric.lock()
    }

    pub fn pool(&self) -> Arc<CandidatePool> {
        self.pool.read().clone()
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

/// One step of the Nginx smooth WRR: add each factor to its credit, pick the
/// first maximum, and charge the winner the factor sum. Over `factor_sum`
/// consecutive calls node `i` wins `factors[i]` times, well interleaved.
fn smooth_wrr_pick(pool: &CandidatePool) -> Option<usize> {
    if pool.is_empty() {
        return None;
    }
    let mut weights = pool.weights.lock();
    let mut best = 0usize;
    let mut best_weight = f64::NEG_INFINITY;
    for i in 0..weights.len() {
        weights[i] += pool.factors[i];
        if weights[i] > best_weight {
            best_weight = weights[i];
            best = i;
        }
    }
    weights[best] -= pool.factor_sum;
    Some(best)
}
