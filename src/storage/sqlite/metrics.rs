//! Operation metrics for the `SQLite` backends.

use std::time::Instant;

/// Records a count and a latency sample for one store operation.
///
/// Emits `repostscan_store_operations_total` and
/// `repostscan_store_operation_duration_ms`, labelled by backend, operation
/// and `"success"`/`"error"` status.
pub fn record_operation<T>(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    result: &crate::Result<T>,
) {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::counter!(
        "repostscan_store_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "repostscan_store_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}
