//! Prometheus metrics for paydesk-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Invoice counter by origin.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "paydesk_invoices_total",
        "Total number of invoices created",
        &["origin"] // manual, bulk
    )
    .expect("Failed to register invoices_total")
});

/// Bulk generation outcomes per student.
pub static BULK_GENERATION_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "paydesk_bulk_generation_total",
        "Bulk invoice generation results per student",
        &["result"] // created, skipped, failed
    )
    .expect("Failed to register bulk_generation_total")
});

/// Payment counter by method and status.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "paydesk_payments_total",
        "Total number of payments by method and status",
        &["method", "status"]
    )
    .expect("Failed to register payments_total")
});

/// Gateway callbacks by outcome.
pub static CALLBACKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "paydesk_gateway_callbacks_total",
        "Mobile money callbacks by outcome",
        &["outcome"]
    )
    .expect("Failed to register gateway_callbacks_total")
});

/// Approval requests by type and resulting status.
pub static APPROVALS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "paydesk_approvals_total",
        "Approval requests by type and status",
        &["request_type", "status"]
    )
    .expect("Failed to register approvals_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "paydesk_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "paydesk_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Mobile money gateway call duration.
pub static GATEWAY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "paydesk_gateway_request_duration_seconds",
        "Mobile money gateway request duration in seconds",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register gateway_request_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&BULK_GENERATION_TOTAL);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&CALLBACKS_TOTAL);
    Lazy::force(&APPROVALS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&GATEWAY_REQUEST_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
