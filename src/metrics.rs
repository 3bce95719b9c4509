//! Metrics collection and export for item pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time snapshot of a pool
///
/// Counts describe the pool right now, totals and seconds only ever grow.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStats {
    /// Live wrappers (idle, reserved in flight or borrowed)
    pub total: usize,

    /// Wrappers waiting in the available queue
    pub idle: usize,

    /// Items currently handed out
    pub borrowed: usize,

    /// Borrowers suspended waiting for an item
    pub pending_consumers: usize,

    pub borrowed_total: u64,
    pub created_total: u64,
    pub deleted_total: u64,

    /// Borrows that failed with a timeout
    pub timeouts_total: u64,

    /// Accumulated time items spent borrowed
    pub in_use_seconds: f64,

    /// Accumulated time spent creating items
    pub creation_seconds: f64,

    /// Accumulated time borrowers waited for an item
    pub wait_seconds: f64,
}

impl PoolStats {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("all_item_count".to_string(), self.total.to_string());
        metrics.insert("idled_item_count".to_string(), self.idle.to_string());
        metrics.insert("borrowed_item_count".to_string(), self.borrowed.to_string());
        metrics.insert("consumer_pending_count".to_string(), self.pending_consumers.to_string());
        metrics.insert("borrowed_total".to_string(), self.borrowed_total.to_string());
        metrics.insert("item_created_total".to_string(), self.created_total.to_string());
        metrics.insert("item_deleted_total".to_string(), self.deleted_total.to_string());
        metrics.insert("borrowing_timeouts_total".to_string(), self.timeouts_total.to_string());
        metrics.insert("item_in_use_total_sec".to_string(), format!("{:.6}", self.in_use_seconds));
        metrics.insert("item_creation_total_sec".to_string(), format!("{:.6}", self.creation_seconds));
        metrics.insert(
            "waiting_for_item_borrowing_total_sec".to_string(),
            format!("{:.6}", self.wait_seconds),
        );
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_itempool::{MetricsExporter, PoolStats};
    /// use std::collections::HashMap;
    ///
    /// let stats = PoolStats { total: 3, idle: 2, borrowed: 1, ..Default::default() };
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stats, "db", Some(&tags));
    /// assert!(output.contains("itempool_items_borrowed{pool=\"db\",service=\"api\"} 1"));
    /// ```
    pub fn export_prometheus(
        stats: &PoolStats,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        // Gauge metrics
        Self::push_metric(&mut output, &labels, "itempool_items", "gauge", "Live pool items", stats.total);
        Self::push_metric(&mut output, &labels, "itempool_items_idle", "gauge", "Idle pool items", stats.idle);
        Self::push_metric(&mut output, &labels, "itempool_items_borrowed", "gauge", "Borrowed pool items", stats.borrowed);
        Self::push_metric(&mut output, &labels, "itempool_consumers_pending", "gauge", "Borrowers waiting for an item", stats.pending_consumers);

        // Counter metrics
        Self::push_metric(&mut output, &labels, "itempool_borrowed_total", "counter", "Total successful borrows", stats.borrowed_total);
        Self::push_metric(&mut output, &labels, "itempool_items_created_total", "counter", "Total items created", stats.created_total);
        Self::push_metric(&mut output, &labels, "itempool_items_deleted_total", "counter", "Total items deleted", stats.deleted_total);
        Self::push_metric(&mut output, &labels, "itempool_borrow_timeouts_total", "counter", "Total borrow timeouts", stats.timeouts_total);
        Self::push_metric(&mut output, &labels, "itempool_in_use_seconds_total", "counter", "Time items spent borrowed", format!("{:.6}", stats.in_use_seconds));
        Self::push_metric(&mut output, &labels, "itempool_creation_seconds_total", "counter", "Time spent creating items", format!("{:.6}", stats.creation_seconds));
        Self::push_metric(&mut output, &labels, "itempool_wait_seconds_total", "counter", "Time borrowers waited for items", format!("{:.6}", stats.wait_seconds));

        output
    }

    fn push_metric(
        output: &mut String,
        labels: &str,
        name: &str,
        kind: &str,
        help: &str,
        value: impl std::fmt::Display,
    ) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    borrowed_total: AtomicU64,
    created_total: AtomicU64,
    deleted_total: AtomicU64,
    timeouts_total: AtomicU64,
    in_use_nanos: AtomicU64,
    creation_nanos: AtomicU64,
    wait_nanos: AtomicU64,
}

fn add_duration(counter: &AtomicU64, duration: Duration) {
    let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
    counter.fetch_add(nanos, Ordering::Relaxed);
}

fn seconds(counter: &AtomicU64) -> f64 {
    counter.load(Ordering::Relaxed) as f64 * 1e-9
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_borrow(&self, waited: Duration) {
        self.borrowed_total.fetch_add(1, Ordering::Relaxed);
        add_duration(&self.wait_nanos, waited);
    }

    pub fn record_created(&self, took: Duration) {
        self.created_total.fetch_add(1, Ordering::Relaxed);
        add_duration(&self.creation_nanos, took);
    }

    pub fn record_deleted(&self) {
        self.deleted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_use(&self, held: Duration) {
        add_duration(&self.in_use_nanos, held);
    }

    pub fn snapshot(
        &self,
        total: usize,
        idle: usize,
        borrowed: usize,
        pending_consumers: usize,
    ) -> PoolStats {
        PoolStats {
            total,
            idle,
            borrowed,
            pending_consumers,
            borrowed_total: self.borrowed_total.load(Ordering::Relaxed),
            created_total: self.created_total.load(Ordering::Relaxed),
            deleted_total: self.deleted_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            in_use_seconds: seconds(&self.in_use_nanos),
            creation_seconds: seconds(&self.creation_nanos),
            wait_seconds: seconds(&self.wait_nanos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_accumulates() {
        let tracker = MetricsTracker::new();
        tracker.record_borrow(Duration::from_millis(500));
        tracker.record_borrow(Duration::from_millis(250));
        tracker.record_created(Duration::from_secs(1));
        tracker.record_timeout();
        tracker.record_deleted();

        let stats = tracker.snapshot(2, 1, 1, 0);

        assert_eq!(stats.borrowed_total, 2);
        assert_eq!(stats.created_total, 1);
        assert_eq!(stats.deleted_total, 1);
        assert_eq!(stats.timeouts_total, 1);
        assert!((stats.wait_seconds - 0.75).abs() < 1e-9);
        assert!((stats.creation_seconds - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_export_uses_stats_names() {
        let stats = PoolStats {
            total: 4,
            borrowed_total: 9,
            ..Default::default()
        };

        let exported = stats.export();

        assert_eq!(exported["all_item_count"], "4");
        assert_eq!(exported["borrowed_total"], "9");
        assert_eq!(exported.len(), 11);
    }

    #[test]
    fn test_prometheus_output_has_help_and_type() {
        let output = MetricsExporter::export_prometheus(&PoolStats::default(), "main", None);

        assert!(output.contains("# TYPE itempool_borrow_timeouts_total counter"));
        assert!(output.contains("itempool_items{pool=\"main\"} 0"));
    }
}
