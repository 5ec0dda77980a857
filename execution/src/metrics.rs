use prometheus_client::{
    metrics::{
        counter::Counter,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use std::sync::atomic::AtomicU64;

/// Engine and store metrics. Cloning shares the underlying series.
#[derive(Clone, Debug)]
pub struct Metrics {
    pub spins: Counter<u64, AtomicU64>,
    pub claims: Counter<u64, AtomicU64>,
    pub limit_exceeded: Counter<u64, AtomicU64>,
    pub stale_forced_ids: Counter<u64, AtomicU64>,
    pub persistence_fallbacks: Counter<u64, AtomicU64>,
    pub compensation_failures: Counter<u64, AtomicU64>,
    pub degraded: Gauge,
    pub spin_latency: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            spins: Counter::default(),
            claims: Counter::default(),
            limit_exceeded: Counter::default(),
            stale_forced_ids: Counter::default(),
            persistence_fallbacks: Counter::default(),
            compensation_failures: Counter::default(),
            degraded: Gauge::default(),
            // 0.5ms .. ~1s
            spin_latency: Histogram::new(exponential_buckets(0.0005, 2.0, 12)),
        }
    }
}

impl Metrics {
    /// Create metrics and register them under `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("spins", "Number of spins resolved", metrics.spins.clone());
        registry.register("claims", "Number of prizes claimed", metrics.claims.clone());
        registry.register(
            "limit_exceeded",
            "Number of spins refused because the budget was exhausted",
            metrics.limit_exceeded.clone(),
        );
        registry.register(
            "stale_forced_ids",
            "Number of forced prize ids that matched nothing in the pool",
            metrics.stale_forced_ids.clone(),
        );
        registry.register(
            "persistence_fallbacks",
            "Number of store calls served by the memory fallback",
            metrics.persistence_fallbacks.clone(),
        );
        registry.register(
            "compensation_failures",
            "Number of consumed spins that could not be released after a failure",
            metrics.compensation_failures.clone(),
        );
        registry.register(
            "degraded",
            "Whether the store is running on its memory fallback",
            metrics.degraded.clone(),
        );
        registry.register(
            "spin_latency_seconds",
            "Time to resolve a spin end to end",
            metrics.spin_latency.clone(),
        );
        metrics
    }
}
