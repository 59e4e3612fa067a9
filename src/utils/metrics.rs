use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::LazyLock;

/// Number of candidates in the currently published pool.
///
/// Dropping to zero means every request will see an empty selection until the
/// next successful refresh. Example query: `candidate_pool_size == 0`.
pub static CANDIDATE_POOL_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("candidate_pool_size", "Number of candidates in the published pool")
        .unwrap()
});

/// Total selections served by the resolver.
///
/// Example query: `rate(select_total[5m])` for selection throughput.
pub static SELECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("select_total", "Total node selections served").unwrap()
});

/// Selections that landed outside the local availability zone.
///
/// The ratio against `select_total` shows how much traffic is spilling; a
/// sustained non-zero rate means the local zone is saturated (or the zone CPU
/// feed is lying). Example query:
/// `rate(cross_zone_select_total[5m]) / rate(select_total[5m])`.
pub static CROSS_ZONE_SELECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("cross_zone_select_total", "Selections outside the local zone").unwrap()
});

/// Refresh cycles that failed and left the previous pool in place.
///
/// Example query: `rate(refresh_failures_total[15m]) > 0`.
pub static REFRESH_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "refresh_failures_total",
        "Refresh cycles that failed and retained the previous pool"
    )
    .unwrap()
});

/// Duration of the full refresh pipeline in seconds.
///
/// The registry watch is a long poll, so values near the configured watch
/// timeout are normal when the topology is quiet.
pub static REFRESH_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "refresh_duration_seconds",
        "Duration of the refresh pipeline",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap()
});

/// Full evictions of the balance-factor cache.
pub static FACTOR_CACHE_EVICTIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("factor_cache_evictions_total", "Balance factor cache full evictions")
        .unwrap()
});
