//! Dump progress counters.
//!
//! Shared by every task of a run. Read by the final summary and by whatever
//! exposes progress to operators.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Key accounting for one dump run.
#[derive(Debug)]
pub struct DumpMetrics {
    started: Instant,
    /// Keys reported by the crawler
    pub total: AtomicU64,
    /// Keys whose value was written
    pub dumped: AtomicU64,
    /// Keys the server no longer had
    pub not_found: AtomicU64,
    /// Keys skipped because they expire soon or cannot be requested
    pub skipped: AtomicU64,
    /// Keys owned by instances outside the dump
    pub filtered: AtomicU64,
    /// Key files fully converted to data files
    pub key_files_processed: AtomicU64,
    /// Record bytes written to data files
    pub bytes_written: AtomicU64,
}

impl Default for DumpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total: AtomicU64::new(0),
            dumped: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            key_files_processed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_dumped(&self, n: u64) {
        self.dumped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_not_found(&self, n: u64) {
        self.not_found.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_key_files_processed(&self) {
        self.key_files_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            keyvalue_metrics: KeyValueMetrics {
                total: self.total.load(Ordering::Relaxed),
                dumped: self.dumped.load(Ordering::Relaxed),
                not_found: self.not_found.load(Ordering::Relaxed),
                skipped: self.skipped.load(Ordering::Relaxed),
                filtered: self.filtered.load(Ordering::Relaxed),
            },
            key_files_processed: self.key_files_processed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            time_elapsed: format_elapsed(self.elapsed()),
        }
    }

    /// Pretty-printed JSON of the current snapshot.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Point-in-time copy of [`DumpMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub keyvalue_metrics: KeyValueMetrics,
    pub key_files_processed: u64,
    pub bytes_written: u64,
    pub time_elapsed: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValueMetrics {
    pub total: u64,
    pub dumped: u64,
    pub not_found: u64,
    pub skipped: u64,
    pub filtered: u64,
}

/// `1h 2m 3s` style rendering.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}.{:03}s", s, elapsed.subsec_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = DumpMetrics::new();
        metrics.add_total(10);
        metrics.add_dumped(6);
        metrics.add_not_found(1);
        metrics.inc_skipped();
        metrics.inc_filtered();
        metrics.inc_filtered();

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.keyvalue_metrics,
            KeyValueMetrics {
                total: 10,
                dumped: 6,
                not_found: 1,
                skipped: 1,
                filtered: 2,
            }
        );
    }

    #[test]
    fn test_json_shape() {
        let metrics = DumpMetrics::new();
        metrics.add_total(3);
        let json: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(json["keyvalue_metrics"]["total"], 3);
        assert_eq!(json["keyvalue_metrics"]["not_found"], 0);
        assert!(json["time_elapsed"].is_string());
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1h 2m 3s");
    }
}
