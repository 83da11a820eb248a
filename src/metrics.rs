//! Prometheus metrics registry and instruments.
//!
//! Counters are process-global; `init_metrics` registers them once at start-up.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbound
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_activities_received_total", "Inbound activities accepted for processing"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref POSTS_INGESTED: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_posts_ingested_total", "Posts stored by the normalizer"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref POSTS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_posts_dropped_total", "Candidates dropped by the accept gate"),
        &["reason"]
    ).expect("metric can be created");

    // Outbound
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_deliveries_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "tidepool_delivery_queue_depth",
        "Delivery jobs waiting for retry"
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "tidepool_federation_request_duration_seconds",
            "Outbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["direction"]
    ).expect("metric can be created");

    // Caches
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Errors
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_errors_total", "Errors returned to HTTP peers"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(ACTIVITIES_RECEIVED.clone()),
            Box::new(POSTS_INGESTED.clone()),
            Box::new(POSTS_DROPPED.clone()),
            Box::new(DELIVERIES_TOTAL.clone()),
            Box::new(DELIVERY_QUEUE_DEPTH.clone()),
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
            Box::new(CACHE_HITS_TOTAL.clone()),
            Box::new(CACHE_MISSES_TOTAL.clone()),
            Box::new(ERRORS_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(error) = REGISTRY.register(collector) {
                tracing::warn!(%error, "Failed to register metric");
            }
        }
        tracing::info!("Metrics registry initialized");
    });
}

/// Record a cache lookup result.
pub fn observe_cache(cache_name: &str, hit: bool) {
    if hit {
        CACHE_HITS_TOTAL.with_label_values(&[cache_name]).inc();
    } else {
        CACHE_MISSES_TOTAL.with_label_values(&[cache_name]).inc();
    }
}
