use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics collector for the application.
///
/// Tracks batch lifecycle, per-item outcomes, phase durations and endpoint
/// usage. Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Batch lifecycle
    batches_started: AtomicUsize,
    batches_completed: AtomicUsize,
    batches_failed: AtomicUsize,
    batches_cancelled: AtomicUsize,

    // Per-item outcomes
    attachments_downloaded: AtomicUsize,
    download_failures: AtomicUsize,
    images_annotated: AtomicUsize,
    annotation_failures: AtomicUsize,

    archives_served: AtomicUsize,
    batches_evicted: AtomicUsize,

    // Phase durations
    fetch_duration_ms: RwLock<Vec<u64>>,
    download_duration_ms: RwLock<Vec<u64>>,
    annotate_duration_ms: RwLock<Vec<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                batches_started: AtomicUsize::new(0),
                batches_completed: AtomicUsize::new(0),
                batches_failed: AtomicUsize::new(0),
                batches_cancelled: AtomicUsize::new(0),
                attachments_downloaded: AtomicUsize::new(0),
                download_failures: AtomicUsize::new(0),
                images_annotated: AtomicUsize::new(0),
                annotation_failures: AtomicUsize::new(0),
                archives_served: AtomicUsize::new(0),
                batches_evicted: AtomicUsize::new(0),
                fetch_duration_ms: RwLock::new(Vec::new()),
                download_duration_ms: RwLock::new(Vec::new()),
                annotate_duration_ms: RwLock::new(Vec::new()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Batch lifecycle
    pub fn record_batch_started(&self) {
        self.inner.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_completed(&self) {
        self.inner.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.inner.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_cancelled(&self) {
        self.inner.batches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    // Item outcomes
    pub fn record_download(&self, success: bool) {
        if success {
            self.inner.attachments_downloaded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.download_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_annotation(&self, success: bool) {
        if success {
            self.inner.images_annotated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.annotation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_archive_served(&self) {
        self.inner.archives_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batches_evicted(&self, count: usize) {
        self.inner.batches_evicted.fetch_add(count, Ordering::Relaxed);
    }

    // Phase durations
    pub fn record_fetch_duration(&self, duration: Duration) {
        self.inner.fetch_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_download_duration(&self, duration: Duration) {
        self.inner.download_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_annotate_duration(&self, duration: Duration) {
        self.inner.annotate_duration_ms.write().push(duration.as_millis() as u64);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner.endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let fetch_avg = avg(&self.inner.fetch_duration_ms.read());
        let download_avg = avg(&self.inner.download_duration_ms.read());
        let annotate_durations = self.inner.annotate_duration_ms.read();
        let annotate_avg = avg(&annotate_durations);
        let annotate_p95 = percentile(&annotate_durations, 0.95);
        drop(annotate_durations);

        let mut endpoint_requests: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        endpoint_requests.sort();

        MetricsSnapshot {
            batches_started: self.inner.batches_started.load(Ordering::Relaxed),
            batches_completed: self.inner.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.inner.batches_failed.load(Ordering::Relaxed),
            batches_cancelled: self.inner.batches_cancelled.load(Ordering::Relaxed),
            attachments_downloaded: self.inner.attachments_downloaded.load(Ordering::Relaxed),
            download_failures: self.inner.download_failures.load(Ordering::Relaxed),
            images_annotated: self.inner.images_annotated.load(Ordering::Relaxed),
            annotation_failures: self.inner.annotation_failures.load(Ordering::Relaxed),
            archives_served: self.inner.archives_served.load(Ordering::Relaxed),
            batches_evicted: self.inner.batches_evicted.load(Ordering::Relaxed),
            fetch_avg_ms: fetch_avg,
            download_avg_ms: download_avg,
            annotate_avg_ms: annotate_avg,
            annotate_p95_ms: annotate_p95,
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP batches_started_total Total number of batches started
# TYPE batches_started_total counter
batches_started_total {{}} {}

# HELP batches_finished_total Batches that ran to an end state
# TYPE batches_finished_total counter
batches_finished_total {{state="completed"}} {}
batches_finished_total {{state="failed"}} {}
batches_finished_total {{state="cancelled"}} {}

# HELP attachments_downloaded_total Attachments saved to a working folder
# TYPE attachments_downloaded_total counter
attachments_downloaded_total {{}} {}

# HELP download_failures_total Attachments skipped because the download failed
# TYPE download_failures_total counter
download_failures_total {{}} {}

# HELP images_annotated_total Images labelled and written back
# TYPE images_annotated_total counter
images_annotated_total {{}} {}

# HELP annotation_failures_total Images skipped during annotation
# TYPE annotation_failures_total counter
annotation_failures_total {{}} {}

# HELP archives_served_total ZIP archives delivered
# TYPE archives_served_total counter
archives_served_total {{}} {}

# HELP batches_evicted_total Finished batches discarded without being downloaded
# TYPE batches_evicted_total counter
batches_evicted_total {{}} {}

# HELP phase_avg_duration_ms Average phase duration in milliseconds
# TYPE phase_avg_duration_ms gauge
phase_avg_duration_ms {{phase="fetch"}} {}
phase_avg_duration_ms {{phase="download"}} {}
phase_avg_duration_ms {{phase="annotate"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.batches_started,
            snapshot.batches_completed,
            snapshot.batches_failed,
            snapshot.batches_cancelled,
            snapshot.attachments_downloaded,
            snapshot.download_failures,
            snapshot.images_annotated,
            snapshot.annotation_failures,
            snapshot.archives_served,
            snapshot.batches_evicted,
            snapshot.fetch_avg_ms,
            snapshot.download_avg_ms,
            snapshot.annotate_avg_ms,
            snapshot.uptime_seconds,
        );

        if !snapshot.endpoint_requests.is_empty() {
            out.push_str("\n# HELP endpoint_requests_total Requests per endpoint\n");
            out.push_str("# TYPE endpoint_requests_total counter\n");
            for (endpoint, count) in &snapshot.endpoint_requests {
                out.push_str(&format!(
                    "endpoint_requests_total {{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_started: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub batches_cancelled: usize,
    pub attachments_downloaded: usize,
    pub download_failures: usize,
    pub images_annotated: usize,
    pub annotation_failures: usize,
    pub archives_served: usize,
    pub batches_evicted: usize,
    pub fetch_avg_ms: u64,
    pub download_avg_ms: u64,
    pub annotate_avg_ms: u64,
    pub annotate_p95_ms: u64,
    pub endpoint_requests: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_batch_started();
        metrics.record_download(true);
        metrics.record_download(true);
        metrics.record_download(false);
        metrics.record_annotation(true);
        metrics.record_annotation(false);
        metrics.record_batch_completed();
        metrics.record_annotate_duration(Duration::from_millis(30));
        metrics.record_annotate_duration(Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_started, 1);
        assert_eq!(snapshot.batches_completed, 1);
        assert_eq!(snapshot.attachments_downloaded, 2);
        assert_eq!(snapshot.download_failures, 1);
        assert_eq!(snapshot.images_annotated, 1);
        assert_eq!(snapshot.annotation_failures, 1);
        assert_eq!(snapshot.annotate_avg_ms, 20);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_batch_started();
        metrics.record_batch_cancelled();
        metrics.record_endpoint_request("/check_status");
        metrics.record_endpoint_request("/check_status");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("batches_started_total {} 1"));
        assert!(prometheus.contains("batches_finished_total {state=\"cancelled\"} 1"));
        assert!(prometheus.contains("endpoint_requests_total {endpoint=\"/check_status\"} 2"));
    }
}
