//! The resolver: construction, lifecycle, and the refresh pipeline.
//!
//! `ZoneResolver` owns the registry client, the balance-factor cache, the
//! PRNG driving cache eviction, and the selector that callers hit on the
//! request path. `start()` runs one refresh inline (startup fails loudly on
//! a broken registry or malformed tuning payloads) and then spawns the
//! periodic refresh task; `stop()` signals that task and joins it.
//!
//! A refresh cycle fetches the four tuning payloads and the service health
//! snapshot into locals before touching any process state, so a failure in
//! the middle of a cycle can never leave half-applied config behind: the
//! previously published pool simply stays live.

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ResolverConfig;
use crate::config_store::{
    decode_cpu_threshold, decode_instance_factors, decode_online_lab, decode_zone_cpu,
    zone_cpu_fresh,
};
use crate::node::{ResolverError, ResolverMetric, ServiceNode};
use crate::pool::{build_candidate_pool, maybe_evict_cache};
use crate::registry::{ConsulClient, RegistryClient};
use crate::selector::Selector;
use crate::topology::build_topology;
use crate::utils::cloud::{self, CloudProvider};
use crate::utils::metrics::{
    FACTOR_CACHE_EVICTIONS_TOTAL, REFRESH_DURATION_SECONDS, REFRESH_FAILURES_TOTAL,
};

/// State owned by the refresh pipeline and carried across cycles.
struct RefreshState {
    last_index: u64,
    factor_cache: HashMap<String, f64>,
    rng: SmallRng,
}

struct Lifecycle {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ZoneResolver {
    registry: Arc<dyn RegistryClient>,
    service: String,
    cpu_threshold_key: String,
    zone_cpu_key: String,
    instance_factor_key: String,
    online_lab_key: String,
    refresh_interval: Duration,
    watch_timeout: Duration,
    zone_cpu_stale_secs: u64,
    cloud_provider: Option<CloudProvider>,
    zone: RwLock<String>,
    state: tokio::sync::Mutex<RefreshState>,
    selector: Selector,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl ZoneResolver {
    /// Builds a resolver over an injected registry client.
    pub fn new(
        config: ResolverConfig,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Arc<Self>, ResolverError> {
        let config = config.finalize()?;
        let settings = config.resolver.expect("finalized config has resolver settings");

        let cloud_provider =
            settings.cloud_provider.as_deref().and_then(CloudProvider::from_name);
        let zone = settings.zone.unwrap_or_else(|| cloud::UNKNOWN_ZONE.to_string());

        Ok(Arc::new(Self {
            registry,
            service: settings.service.expect("finalized config has service"),
            cpu_threshold_key: settings.cpu_threshold_key.unwrap_or_default(),
            zone_cpu_key: settings.zone_cpu_key.unwrap_or_default(),
            instance_factor_key: settings.instance_factor_key.unwrap_or_default(),
            online_lab_key: settings.online_lab_key.unwrap_or_default(),
            refresh_interval: Duration::from_secs(settings.refresh_interval_secs.unwrap_or(1)),
            watch_timeout: Duration::from_secs(settings.watch_timeout_secs.unwrap_or(1)),
            zone_cpu_stale_secs: settings.zone_cpu_stale_secs.unwrap_or(1),
            cloud_provider,
            zone: RwLock::new(zone),
            state: tokio::sync::Mutex::new(RefreshState {
                last_index: 0,
                factor_cache: HashMap::new(),
                rng: SmallRng::from_entropy(),
            }),
            selector: Selector::new(),
            lifecycle: Mutex::new(None),
        }))
    }

    /// Builds a resolver backed by a Consul agent at the configured address.
    pub fn connect(config: ResolverConfig) -> Result<Arc<Self>, ResolverError> {
        let config = config.finalize()?;
        let address = config
            .registry
            .as_ref()
            .and_then(|r| r.address.clone())
            .expect("finalized config has registry address");
        let registry = Arc::new(ConsulClient::new(&address)?);
        Self::new(config, registry)
    }

    /// Runs one refresh inline, then spawns the periodic refresh task.
    ///
    /// A failed initial refresh is fatal: callers should not serve traffic
    /// from a resolver that never saw the registry.
    pub async fn start(self: &Arc<Self>) -> Result<(), ResolverError> {
        if *self.zone.read() == cloud::UNKNOWN_ZONE {
            if let Some(provider) = self.cloud_provider {
                let probed = cloud::probe_zone(provider).await;
                info!(zone = %probed, "local zone resolved from cloud metadata");
                *self.zone.write() = probed;
            } else {
                warn!("no zone override and no cloud provider configured; local zone is unknown");
            }
        }

        self.refresh_all().await?;
        info!(
            service = %self.service,
            zone = %self.zone.read(),
            interval_secs = self.refresh_interval.as_secs(),
            "resolver started"
        );

        let resolver = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(async move {
            let mut ticker = interval(resolver.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately and the initial refresh
            // already ran; consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        info!("refresh task received shutdown signal, exiting");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = resolver.refresh_all().await {
                            REFRESH_FAILURES_TOTAL.inc();
                            warn!(error = %e, "refresh failed; keeping previous candidate pool");
                        }
                    }
                }
            }
        });
        *self.lifecycle.lock() = Some(Lifecycle { shutdown_tx, handle });
        Ok(())
    }

    /// Signals the refresh task and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        let lifecycle = self.lifecycle.lock().take();
        if let Some(Lifecycle { shutdown_tx, handle }) = lifecycle {
            drop(shutdown_tx);
            if let Err(e) = handle.await {
                warn!(error = %e, "refresh task did not exit cleanly");
            }
            info!(service = %self.service, "resolver stopped");
        }
    }

    /// Picks the next backend, or `None` while the pool is empty.
    pub fn select_node(&self) -> Option<ServiceNode> {
        self.selector.select(&self.zone.read())
    }

    /// Forces one refresh cycle outside the periodic cadence.
    pub async fn refresh_now(&self) -> Result<(), ResolverError> {
        self.refresh_all().await
    }

    pub fn set_zone(&self, zone: &str) {
        *self.zone.write() = zone.to_string();
    }

    pub fn zone(&self) -> String {
        self.zone.read().clone()
    }

    pub fn metric(&self) -> ResolverMetric {
        self.selector.metric()
    }

    async fn refresh_all(&self) -> Result<(), ResolverError> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        let threshold_raw = self.registry.kv_get(&self.cpu_threshold_key).await?;
        let cpu_threshold = decode_cpu_threshold(&self.cpu_threshold_key, &threshold_raw)?;

        let zone_cpu_raw = self.registry.kv_get(&self.zone_cpu_key).await?;
        let (zone_cpu_stamp, zone_cpu) = decode_zone_cpu(&self.zone_cpu_key, &zone_cpu_raw)?;

        let lab_raw = self.registry.kv_get(&self.online_lab_key).await?;
        let lab = decode_online_lab(&self.online_lab_key, &lab_raw)?;

        let factors_raw = self.registry.kv_get(&self.instance_factor_key).await?;
        let (_, instance_cpu) = decode_instance_factors(&self.instance_factor_key, &factors_raw)?;

        let (entries, last_index) = self
            .registry
            .service_health(&self.service, state.last_index, self.watch_timeout)
            .await?;

        let now_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let zone_cpu_updated = zone_cpu_fresh(zone_cpu_stamp, now_epoch, self.zone_cpu_stale_secs);
        let local_zone = self.zone.read().clone();
        let topo = build_topology(&entries, &zone_cpu, &instance_cpu, &local_zone, last_index);

        // Everything fetched and decoded; commit from here on.
        state.last_index = last_index;
        let RefreshState { rng, factor_cache, .. } = &mut *state;
        if maybe_evict_cache(rng, factor_cache, lab.factor_cache_expire) {
            FACTOR_CACHE_EVICTIONS_TOTAL.inc();
        }
        let pool =
            build_candidate_pool(&topo, &lab, cpu_threshold, zone_cpu_updated, factor_cache);
        if pool.is_empty() {
            warn!(service = %self.service, "refresh produced an empty candidate pool");
        }

        info!(
            service = %self.service,
            zones = topo.zones.len(),
            candidates = pool.len(),
            index = last_index,
            cpu_threshold = cpu_threshold,
            zone_cpu_updated = zone_cpu_updated,
            cross_zone = lab.cross_zone,
            "refresh complete"
        );
        self.selector.publish(pool);
        REFRESH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        Ok(())
    }
}
