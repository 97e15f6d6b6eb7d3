//! Cache and pod counters, shared between the fetch engine, jobs and the
//! HTTP layer. All fields are atomic for lock-free reads.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    /// Feeds whose body hit the fetch size limit.
    pub cache_limited: AtomicU64,
    pub cache_fetch_errors: AtomicU64,
    /// Feeds requested in the last fetch cycle.
    pub cache_sources: AtomicU64,
    pub cache_feeds: AtomicU64,
    pub cache_twts: AtomicU64,
    pub cache_last_processed_seconds: AtomicU64,
    pub archive_size: AtomicU64,
    pub archive_errors: AtomicU64,
    pub converge_requests: AtomicU64,
    pub converge_found: AtomicU64,
    pub server_dau: AtomicU64,
    pub server_mau: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_limited: u64,
    pub cache_fetch_errors: u64,
    pub cache_sources: u64,
    pub cache_feeds: u64,
    pub cache_twts: u64,
    pub cache_last_processed_seconds: u64,
    pub archive_size: u64,
    pub archive_errors: u64,
    pub converge_requests: u64,
    pub converge_found: u64,
    pub server_dau: u64,
    pub server_mau: u64,
}

impl Metrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            cache_limited: get(&self.cache_limited),
            cache_fetch_errors: get(&self.cache_fetch_errors),
            cache_sources: get(&self.cache_sources),
            cache_feeds: get(&self.cache_feeds),
            cache_twts: get(&self.cache_twts),
            cache_last_processed_seconds: get(&self.cache_last_processed_seconds),
            archive_size: get(&self.archive_size),
            archive_errors: get(&self.archive_errors),
            converge_requests: get(&self.converge_requests),
            converge_found: get(&self.converge_found),
            server_dau: get(&self.server_dau),
            server_mau: get(&self.server_mau),
        }
    }
}
