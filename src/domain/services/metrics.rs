//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                           | Key Methods       |
// |--------------------|-------------------------------------------------------|-------------------|
// | ConsumerMetrics    | Process-scoped delivery counters and heartbeat        | record_*, snapshot|
// | MetricsSnapshot    | Serializable point-in-time copy of the counters       |                   |
//--------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Counters shared by the event bus and the subscription initializer.
///
/// One instance is created per process and handed around as
/// `Arc<ConsumerMetrics>`.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
    published: AtomicU64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`ConsumerMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub decode_failures: u64,
    pub published: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delivery reached a consume loop
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.heartbeat();
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery was acknowledged without being applied (unresolved
    /// callback, validation failure, foreign routing key)
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the consumer as alive now
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Some(Utc::now());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            last_heartbeat: *self.last_heartbeat.lock(),
        }
    }
}
