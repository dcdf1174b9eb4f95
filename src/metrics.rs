// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters, updated with relaxed atomics on the hot paths.
#[derive(Default)]
pub struct Metrics {
    connections: AtomicU64,
    requests: AtomicU64,
    bytes_written: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub requests: u64,
    pub bytes_written: u64,
}
