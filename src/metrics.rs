//! Metrics collection
//!
//! Thread-safe counters over atomics with a point-in-time snapshot view.
//! The host scrapes [`EsiMetrics::snapshot`] into whatever exposition
//! format it runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the middleware pipeline.
#[derive(Debug, Default)]
pub struct EsiMetrics {
    // Request statistics
    requests_total: AtomicU64,
    passthrough_requests: AtomicU64,

    // Parse cache
    parse_cache_hits: AtomicU64,
    parse_cache_misses: AtomicU64,
    parse_cache_purges: AtomicU64,

    // Backend fetches
    backend_fetches: AtomicU64,
    backend_failures: AtomicU64,
    on_error_served: AtomicU64,

    // Result cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Coalescer
    coalesce_joins: AtomicU64,
}

/// Snapshot of all counters at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub passthrough_requests: u64,
    pub parse_cache_hits: u64,
    pub parse_cache_misses: u64,
    pub parse_cache_purges: u64,
    pub backend_fetches: u64,
    pub backend_failures: u64,
    pub on_error_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesce_joins: u64,
}

impl EsiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed request; `transformed` is false when the body
    /// passed through untouched.
    pub fn record_request(&self, transformed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !transformed {
            self.passthrough_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a parse-cache lookup.
    pub fn record_parse_cache(&self, hit: bool) {
        if hit {
            self.parse_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.parse_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a parse-cache purge triggered by the command header.
    pub fn record_purge(&self) {
        self.parse_cache_purges.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one backend fetch attempt and its outcome.
    pub fn record_backend_fetch(&self, success: bool) {
        self.backend_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.backend_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an entity answered with its on-error payload.
    pub fn record_on_error_served(&self) {
        self.on_error_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a result-cache lookup.
    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a fetch that subscribed to another caller's in-flight fetch.
    pub fn record_coalesce_join(&self) {
        self.coalesce_joins.fetch_add(1, Ordering::Relaxed);
    }

    /// A consistent-enough view of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            passthrough_requests: self.passthrough_requests.load(Ordering::Relaxed),
            parse_cache_hits: self.parse_cache_hits.load(Ordering::Relaxed),
            parse_cache_misses: self.parse_cache_misses.load(Ordering::Relaxed),
            parse_cache_purges: self.parse_cache_purges.load(Ordering::Relaxed),
            backend_fetches: self.backend_fetches.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            on_error_served: self.on_error_served.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesce_joins: self.coalesce_joins.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = EsiMetrics::new();
        metrics.record_request(true);
        metrics.record_request(false);
        metrics.record_parse_cache(true);
        metrics.record_parse_cache(false);
        metrics.record_backend_fetch(true);
        metrics.record_backend_fetch(false);
        metrics.record_on_error_served();
        metrics.record_cache(true);
        metrics.record_coalesce_join();
        metrics.record_purge();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.passthrough_requests, 1);
        assert_eq!(snap.parse_cache_hits, 1);
        assert_eq!(snap.parse_cache_misses, 1);
        assert_eq!(snap.backend_fetches, 2);
        assert_eq!(snap.backend_failures, 1);
        assert_eq!(snap.on_error_served, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.coalesce_joins, 1);
        assert_eq!(snap.parse_cache_purges, 1);
    }
}
