use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-wide counters, surfaced on the management API's health
/// endpoint.
#[derive(Debug)]
pub struct Stats {
    pub start_time: Instant,
    pub requests: AtomicU64,
    pub redactions: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Stats {
            start_time: Instant::now(),
            requests: AtomicU64::new(0),
            redactions: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        })
    }

    pub fn add_request(&self, bytes: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_response(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_redactions(&self, count: u64) {
        if count > 0 {
            self.redactions.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "requests": self.requests.load(Ordering::Relaxed),
            "redactions": self.redactions.load(Ordering::Relaxed),
            "bytes_in": self.bytes_in.load(Ordering::Relaxed),
            "bytes_out": self.bytes_out.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.add_request(100);
        stats.add_request(50);
        stats.add_response(200);
        stats.add_redactions(3);
        stats.add_redactions(0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["requests"], 2);
        assert_eq!(snapshot["bytes_in"], 150);
        assert_eq!(snapshot["bytes_out"], 200);
        assert_eq!(snapshot["redactions"], 3);
    }
}
