//! Prometheus metrics for the ingestion pipeline.
//!
//! Counters cover both sides of the queue fabric: items published by the
//! dispatcher and the reply fan-out, and per-queue delivery outcomes in the
//! workers.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ingest";

lazy_static! {
    /// Items published to each queue
    pub static ref ITEMS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_published_total", METRIC_PREFIX),
        "Total queue items published",
        &["queue"]
    ).unwrap();

    /// Deliveries received by each worker
    pub static ref ITEMS_CONSUMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_consumed_total", METRIC_PREFIX),
        "Total deliveries consumed",
        &["queue"]
    ).unwrap();

    /// Deliveries acknowledged after successful persistence
    pub static ref ITEMS_ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_acked_total", METRIC_PREFIX),
        "Total deliveries acknowledged",
        &["queue"]
    ).unwrap();

    /// Deliveries negatively acknowledged with requeue (transient failures)
    pub static ref ITEMS_REQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_requeued_total", METRIC_PREFIX),
        "Total deliveries nacked with requeue",
        &["queue"]
    ).unwrap();

    /// Poison deliveries dropped without requeue
    pub static ref ITEMS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_dropped_total", METRIC_PREFIX),
        "Total poison deliveries dropped",
        &["queue"]
    ).unwrap();

    /// Channels skipped by the dispatcher (join/publish/fetch failures)
    pub static ref CHANNELS_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_channels_skipped_total", METRIC_PREFIX),
        "Total channels skipped during dispatch"
    ).unwrap();

    /// Reply items published by the fan-out
    pub static ref REPLIES_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_replies_published_total", METRIC_PREFIX),
        "Total reply items published by fan-out"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register() {
        ITEMS_PUBLISHED_TOTAL.with_label_values(&["user_queue"]).inc();
        ITEMS_CONSUMED_TOTAL.with_label_values(&["user_queue"]).inc();
        CHANNELS_SKIPPED_TOTAL.inc();
        REPLIES_PUBLISHED_TOTAL.inc();
        // Just verify no panics
    }
}
