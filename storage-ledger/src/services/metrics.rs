//! Prometheus metrics for storage-ledger.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};

/// Counter for ledger operations by operation and outcome.
pub static LEDGER_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "storage_ledger_operations_total",
        "Total number of ledger operations",
        &["operation", "status"]
    )
    .expect("Failed to register LEDGER_OPERATIONS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "storage_ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Rent billed on withdrawals (not per warehouse to bound cardinality).
pub static RENT_BILLED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "storage_ledger_rent_billed_total",
        "Total rent billed on withdrawals"
    )
    .expect("Failed to register RENT_BILLED")
});

/// Notifications that could not be delivered.
pub static NOTIFICATION_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "storage_ledger_notification_failures_total",
        "Total number of failed ledger notifications",
        &["event"]
    )
    .expect("Failed to register NOTIFICATION_FAILURES")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&LEDGER_OPERATIONS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&RENT_BILLED);
    Lazy::force(&NOTIFICATION_FAILURES);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record the outcome of a ledger operation.
pub fn record_operation(operation: &str, status: &str) {
    LEDGER_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record rent billed by a withdrawal or revision.
pub fn record_rent_billed(amount: f64) {
    if amount > 0.0 {
        RENT_BILLED.inc_by(amount);
    }
}

/// Record a notification that failed to send.
pub fn record_notification_failure(event: &str) {
    NOTIFICATION_FAILURES.with_label_values(&[event]).inc();
}
