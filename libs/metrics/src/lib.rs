//! Process-wide Prometheus metrics, registered once against the default
//! registry and exposed to the HTTP status endpoint for scraping.
//!
//! Mirrors the ambient pattern this codebase's ancestry uses everywhere
//! else: no per-subsystem registries, one `Lazy` static per metric family,
//! registered against `prometheus::default_registry()` the first time it's
//! touched.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub static SCAN_PASSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "syncengine_scan_passes_total",
        "Completed local scanner passes, across all sync-roots.",
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .unwrap();
    c
});

pub static TASKS_ENQUEUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "syncengine_tasks_enqueued_total",
            "Tasks appended to the queue, by task type.",
        ),
        &["task_type"],
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .unwrap();
    c
});

pub static TASKS_COMPLETED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "syncengine_tasks_completed_total",
            "Tasks that finished, by task type and outcome.",
        ),
        &["task_type", "outcome"],
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .unwrap();
    c
});

pub static TASK_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "syncengine_task_queue_depth",
        "Rows currently pending in the task table.",
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(g.clone()))
        .unwrap();
    g
});

pub static UPLOAD_BYTES_TRANSFERRED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "syncengine_upload_bytes_transferred_total",
        "Raw bytes actually sent to the server over upload_write, excluding server-side copies.",
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .unwrap();
    c
});

pub static UPLOAD_BYTES_DEDUPLICATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "syncengine_upload_bytes_deduplicated_total",
        "Bytes satisfied by a server-side copy instead of a client transfer.",
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .unwrap();
    c
});

pub static UPLOADS_IN_PROGRESS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "syncengine_uploads_in_progress",
        "UPLOAD_FILE tasks currently executing, bounded by PSYNC_MAX_PARALLEL_UPLOADS.",
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(g.clone()))
        .unwrap();
    g
});

pub static POOL_SOCKETS_CACHED: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "syncengine_pool_sockets_cached",
            "Idle sockets currently held in the connection pool cache, by host.",
        ),
        &["host"],
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(g.clone()))
        .unwrap();
    g
});

pub static NETWORK_EXCEPTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "syncengine_network_exceptions_total",
        "Connection-pool acquire failures, each of which pokes the global retry timer.",
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .unwrap();
    c
});

static BUILD_INFO: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("syncengine_build_info", "Always 1; labels carry the build identity."),
        &["revision"],
    )
    .unwrap();
    prometheus::default_registry()
        .register(Box::new(g.clone()))
        .unwrap();
    g
});

/// Sets the single `syncengine_build_info{revision=...}` gauge to 1, the
/// conventional way to surface "what's running" to a metrics scraper
/// without a dedicated endpoint.
pub fn set_build_info_metric(revision: &str) {
    BUILD_INFO.with_label_values(&[revision]).set(1);
}

/// Serializes the default registry's current state in the Prometheus text
/// exposition format, for the status HTTP endpoint to hand back as-is.
pub fn gather() -> Vec<u8> {
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .expect("encoding the default registry should never fail");
    buffer
}

/// Exposed for tests that want a private registry instead of mutating the
/// process-global default one.
pub fn new_test_registry() -> Registry {
    Registry::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_registered_families() {
        SCAN_PASSES_TOTAL.inc();
        let text = String::from_utf8(gather()).unwrap();
        assert!(text.contains("syncengine_scan_passes_total"));
    }
}
