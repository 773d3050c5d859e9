//! Metrics for the log broadcaster.

/// Identifier for the counter of raw logs accepted into the unconfirmed pool.
pub const LOGS_RECEIVED: &str = "vigil_log_broadcaster_logs_received";

/// Identifier for the counter of heads acted on by the dispatch pass.
pub const HEADS_PROCESSED: &str = "vigil_log_broadcaster_heads_processed";

/// Identifier for the counter of broadcasts dispatched to listeners.
pub const BROADCASTS_DISPATCHED: &str = "vigil_log_broadcaster_broadcasts_dispatched";

/// Identifier for the counter of upstream resubscribe cycles.
pub const RESUBSCRIBES: &str = "vigil_log_broadcaster_resubscribes";

/// Describes all metrics the broadcaster may produce.
///
/// Call once during application startup if metric descriptions are desired
/// for observers like Prometheus. Guarded by the `metrics` feature flag.
pub fn describe_broadcaster_metrics() {
    #[cfg(feature = "metrics")]
    {
        metrics::describe_counter!(
            LOGS_RECEIVED,
            metrics::Unit::Count,
            "Raw logs accepted into the unconfirmed log pool."
        );
        metrics::describe_counter!(
            HEADS_PROCESSED,
            metrics::Unit::Count,
            "Canonical heads acted on by the dispatch pass."
        );
        metrics::describe_counter!(
            BROADCASTS_DISPATCHED,
            metrics::Unit::Count,
            "Log broadcasts dispatched to listeners."
        );
        metrics::describe_counter!(
            RESUBSCRIBES,
            metrics::Unit::Count,
            "Upstream resubscribe cycles, both intentional and error-driven."
        );
    }
}
