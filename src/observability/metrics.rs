//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (filters, connections, snapshots, requests)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by listener, method, status
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_filter_invocations_total` (counter): by filter, phase, status
//! - `gateway_filter_duration_seconds` (histogram): by filter, phase
//! - `gateway_connections_total` (counter): opens and closes by listener, reason
//! - `gateway_active_connections` (gauge): by listener
//! - `gateway_filter_snapshot_version` (gauge): last published snapshot
//! - `gateway_filter_snapshot_size` (gauge): filters in that snapshot
//! - `gateway_filter_compile_failures_total` (counter): by filter
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps tests quiet
//! - Skipped filters are counted but not timed

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::engine::notifier::{ConnectionEvent, ConnectionUsage, FilterStatus, FilterUsage};

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(listener: &str, method: &str, status: u16, duration: Duration) {
    ::metrics::counter!(
        "gateway_requests_total",
        "listener" => listener.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    ::metrics::histogram!(
        "gateway_request_duration_seconds",
        "listener" => listener.to_string(),
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_filter_usage(usage: &FilterUsage) {
    let filter = usage.filter.to_string();
    let phase = usage.phase.as_str();
    ::metrics::counter!(
        "gateway_filter_invocations_total",
        "filter" => filter.clone(),
        "phase" => phase,
        "status" => usage.status.as_str(),
    )
    .increment(1);

    if usage.status != FilterStatus::Skipped {
        ::metrics::histogram!(
            "gateway_filter_duration_seconds",
            "filter" => filter,
            "phase" => phase,
        )
        .record(usage.duration.as_secs_f64());
    }
}

pub fn record_connection_event(usage: &ConnectionUsage) {
    let listener = usage.listener.to_string();
    match usage.event {
        ConnectionEvent::Open => {
            ::metrics::counter!(
                "gateway_connections_total",
                "listener" => listener.clone(),
                "event" => "open",
            )
            .increment(1);
            ::metrics::gauge!("gateway_active_connections", "listener" => listener).increment(1.0);
        }
        ConnectionEvent::Close(reason) => {
            ::metrics::counter!(
                "gateway_connections_total",
                "listener" => listener.clone(),
                "event" => "close",
                "reason" => reason.as_str(),
            )
            .increment(1);
            ::metrics::gauge!("gateway_active_connections", "listener" => listener).decrement(1.0);
        }
    }
}

pub fn record_snapshot_published(version: u64, filters: usize) {
    ::metrics::gauge!("gateway_filter_snapshot_version").set(version as f64);
    ::metrics::gauge!("gateway_filter_snapshot_size").set(filters as f64);
}

pub fn record_compile_failure(filter: &str) {
    ::metrics::counter!("gateway_filter_compile_failures_total", "filter" => filter.to_string())
        .increment(1);
}
