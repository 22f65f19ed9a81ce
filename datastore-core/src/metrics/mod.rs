//! Metrics for store activity
//!
//! Every metric carries a `store` label with the store name. Recording is a
//! no-op until the application installs a `metrics` recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::{Duration, Instant};

pub const LOADS: &str = "datastore.loads";
pub const CORRUPTIONS: &str = "datastore.corruptions";
pub const COMMITS: &str = "datastore.commits";
pub const FAILED_WRITES: &str = "datastore.writes.failed";
pub const FAILED_TRANSACTIONS: &str = "datastore.transactions.failed";
pub const LAGGED_SUBSCRIBERS: &str = "datastore.subscribers.lagged";
pub const WRITE_DURATION: &str = "datastore.write.duration_ms";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(LOADS, "Store file reads, including reads of a missing file");
    describe_counter!(CORRUPTIONS, "Store files that failed to decode");
    describe_counter!(COMMITS, "Transactions committed and persisted");
    describe_counter!(FAILED_WRITES, "Commits whose file write failed");
    describe_counter!(FAILED_TRANSACTIONS, "Transactions that returned an error");
    describe_counter!(
        LAGGED_SUBSCRIBERS,
        "Snapshots dropped from full subscriber buffers"
    );
    describe_histogram!(
        WRITE_DURATION,
        Unit::Milliseconds,
        "Time spent writing and syncing a store file"
    );
}

/// Increment a per-store counter
pub fn record_counter(name: &'static str, store: &str, value: u64) {
    counter!(name, "store" => store.to_string()).increment(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    store: String,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str, store: impl Into<String>) -> Self {
        Self {
            name,
            store: store.into(),
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        histogram!(self.name, "store" => self.store).record(elapsed.as_secs_f64() * 1000.0);
        elapsed
    }
}
