//! Prometheus metrics for reconciliation-service.

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::time::Instant;

/// Counter for HTTP requests by method, route and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for HTTP request duration by method and route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for imported statement records by outcome.
pub static IMPORTED_TRANSACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_imported_transactions_total",
        "Statement records processed by import, by outcome",
        &["outcome"]
    )
    .expect("Failed to register IMPORTED_TRANSACTIONS")
});

/// Counter for matcher decisions.
pub static TRANSACTION_MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_transaction_matches_total",
        "Total number of matcher decisions",
        &["match_type"]
    )
    .expect("Failed to register TRANSACTION_MATCHES")
});

/// Counter for lifecycle operations (manual match, unmatch, write-off).
pub static LIFECYCLE_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_lifecycle_operations_total",
        "Total number of reconciliation lifecycle operations",
        &["operation", "status"]
    )
    .expect("Failed to register LIFECYCLE_OPERATIONS")
});

/// Counter for compensating writes against the payment ledger.
pub static PAYMENT_COMPENSATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_payment_compensations_total",
        "Compensating payment ledger writes after a failed transaction update",
        &["operation", "status"]
    )
    .expect("Failed to register PAYMENT_COMPENSATIONS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&IMPORTED_TRANSACTIONS);
    Lazy::force(&TRANSACTION_MATCHES);
    Lazy::force(&LIFECYCLE_OPERATIONS);
    Lazy::force(&PAYMENT_COMPENSATIONS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record the outcome of one imported statement record.
pub fn record_imported_transaction(outcome: &str) {
    IMPORTED_TRANSACTIONS.with_label_values(&[outcome]).inc();
}

/// Record a matcher decision.
pub fn record_transaction_match(match_type: &str) {
    TRANSACTION_MATCHES.with_label_values(&[match_type]).inc();
}

/// Record a lifecycle operation.
pub fn record_lifecycle_operation(operation: &str, status: &str) {
    LIFECYCLE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a compensating ledger write.
pub fn record_payment_compensation(operation: &str, status: &str) {
    PAYMENT_COMPENSATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Axum middleware recording request count and latency per matched route.
pub async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS
        .with_label_values(&[&method, &route, &status])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &route])
        .observe(start.elapsed().as_secs_f64());

    response
}
