//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define dispatch and cache metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `route_cache_requests_total` (counter): requests by method, status, matched route
//! - `route_cache_request_duration_seconds` (histogram): dispatch latency
//! - `route_cache_lookups_total` (counter): cache lookups by group and outcome
//!   (`hit`, `miss`, `stale`, `bypass`)
//! - `route_cache_recomputes_total` (counter): recomputations started by group
//! - `route_cache_storage_errors_total` (counter): storage failures by operation
//! - `route_cache_pipeline_updates_total` (counter): routing snapshots published
//!
//! # Design Decisions
//! - Labels are low-cardinality: route patterns, never concrete paths
//! - Recording without an installed exporter is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("route_cache_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        );

    let builder = match builder {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!(error = %e, "Invalid histogram buckets, using defaults");
            PrometheusBuilder::new().with_http_listener(addr)
        }
    };

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one dispatched request.
pub fn record_request(method: &str, status: u16, route: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("route", route.to_string()),
    ];
    metrics::counter!("route_cache_requests_total", &labels).increment(1);
    metrics::histogram!("route_cache_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(group: &str, outcome: &'static str) {
    metrics::counter!(
        "route_cache_lookups_total",
        "group" => group.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_recompute(group: &str) {
    metrics::counter!("route_cache_recomputes_total", "group" => group.to_string()).increment(1);
}

pub fn record_storage_error(operation: &'static str) {
    metrics::counter!("route_cache_storage_errors_total", "operation" => operation).increment(1);
}

pub fn record_pipeline_update(handlers: usize, rules: usize) {
    metrics::counter!("route_cache_pipeline_updates_total").increment(1);
    metrics::gauge!("route_cache_handlers").set(handlers as f64);
    metrics::gauge!("route_cache_rule_bundles").set(rules as f64);
}
