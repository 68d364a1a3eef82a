//! Metric names and descriptions.
//!
//! The runtime records through the `metrics` facade only; installing a
//! recorder (Prometheus or otherwise) is up to the application. Call
//! [`register_metrics`] once after installing it so the descriptions show up.
//!
//! Nothing is recorded on the zero-listener fast path.

use metrics::{describe_counter, describe_histogram};

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Orchestrated invocations that had at least one listener, by `operation`.
pub const INVOCATIONS_TOTAL: &str = "hooks_invocations_total";

/// Invocations vetoed by a before-listener.
pub const INVOCATIONS_SKIPPED_TOTAL: &str = "hooks_invocations_skipped_total";

/// Listener calls, by `phase`.
pub const LISTENERS_INVOKED_TOTAL: &str = "hooks_listeners_invoked_total";

/// Wall time of orchestrated invocations, listeners included.
pub const INVOCATION_DURATION_SECONDS: &str = "hooks_invocation_duration_seconds";

/// Store reads issued by document caches.
pub const CACHE_FETCHES_TOTAL: &str = "hooks_cache_fetches_total";

/// Document requests answered by an existing cache entry.
pub const CACHE_HITS_TOTAL: &str = "hooks_cache_hits_total";

/// Items dispatched by the batch runner.
pub const BATCH_ITEMS_TOTAL: &str = "hooks_batch_items_total";

/// Per-item errors collected by the batch runner.
pub const BATCH_ERRORS_TOTAL: &str = "hooks_batch_errors_total";

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        INVOCATIONS_TOTAL,
        "Total number of orchestrated invocations with listeners"
    );
    describe_counter!(
        INVOCATIONS_SKIPPED_TOTAL,
        "Total number of invocations skipped by a before-listener"
    );
    describe_counter!(
        LISTENERS_INVOKED_TOTAL,
        "Total number of listener calls"
    );
    describe_histogram!(
        INVOCATION_DURATION_SECONDS,
        "Time taken by orchestrated invocations including listeners"
    );

    describe_counter!(
        CACHE_FETCHES_TOTAL,
        "Total number of store reads issued by document caches"
    );
    describe_counter!(
        CACHE_HITS_TOTAL,
        "Total number of document requests served from a cache entry"
    );

    describe_counter!(
        BATCH_ITEMS_TOTAL,
        "Total number of items dispatched by the batch runner"
    );
    describe_counter!(
        BATCH_ERRORS_TOTAL,
        "Total number of per-item errors collected by the batch runner"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_without_recorder_is_harmless() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_names_share_prefix() {
        for name in [
            INVOCATIONS_TOTAL,
            INVOCATIONS_SKIPPED_TOTAL,
            LISTENERS_INVOKED_TOTAL,
            INVOCATION_DURATION_SECONDS,
            CACHE_FETCHES_TOTAL,
            CACHE_HITS_TOTAL,
            BATCH_ITEMS_TOTAL,
            BATCH_ERRORS_TOTAL,
        ] {
            assert!(name.starts_with("hooks_"), "{name}");
        }
    }
}
