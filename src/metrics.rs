//! Request statistics for the classification service.

use crate::error::ClassifyError;
use crate::types::class::{Classification, PlanetClass};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Latency samples kept before the oldest half is dropped
const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Metrics collector shared by every request
pub struct ServiceMetrics {
    /// Successful classifications
    pub classifications: AtomicU64,
    /// Requests rejected by validation
    pub validation_failures: AtomicU64,
    /// Requests failed because the artifacts could not be loaded
    pub artifact_failures: AtomicU64,
    /// Requests failed inside the classifier
    pub internal_failures: AtomicU64,
    /// Completed artifact loads
    pub artifact_loads: AtomicU64,
    by_class: RwLock<BTreeMap<PlanetClass, u64>>,
    /// Classification latencies (in microseconds)
    latencies: RwLock<Vec<u64>>,
    confidence_buckets: RwLock<[u64; 10]>,
    load_time: RwLock<Option<Duration>>,
    start_time: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            classifications: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            artifact_failures: AtomicU64::new(0),
            internal_failures: AtomicU64::new(0),
            artifact_loads: AtomicU64::new(0),
            by_class: RwLock::new(BTreeMap::new()),
            latencies: RwLock::new(Vec::with_capacity(1000)),
            confidence_buckets: RwLock::new([0; 10]),
            load_time: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    /// Record a successful classification
    pub fn record_classification(&self, latency: Duration, result: &Classification) {
        self.classifications.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut by_class) = self.by_class.write() {
            *by_class.entry(result.classification).or_insert(0) += 1;
        }

        if let Ok(mut times) = self.latencies.write() {
            times.push(latency.as_micros() as u64);
            if times.len() > MAX_LATENCY_SAMPLES {
                times.drain(0..MAX_LATENCY_SAMPLES / 2);
            }
        }

        let bucket = (result.confidence.clamp(0.0, 1.0) * 10.0).min(9.0) as usize;
        if let Ok(mut buckets) = self.confidence_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Record a failed classification by kind
    pub fn record_failure(&self, error: &ClassifyError) {
        let counter = match error {
            ClassifyError::Validation(_) => &self.validation_failures,
            ClassifyError::ArtifactLoad(_) => &self.artifact_failures,
            ClassifyError::Internal => &self.internal_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed artifact load
    pub fn record_artifact_load(&self, duration: Duration) {
        self.artifact_loads.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut load_time) = self.load_time.write() {
            *load_time = Some(duration);
        }
    }

    /// Get latency statistics
    pub fn get_latency_stats(&self) -> LatencyStats {
        let times = self.latencies.read().unwrap_or_else(PoisonError::into_inner);
        if times.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        LatencyStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// Get current throughput (classifications per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.classifications.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Classifications per predicted class
    pub fn get_counts_by_class(&self) -> BTreeMap<PlanetClass, u64> {
        self.by_class
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Confidence histogram in tenths
    pub fn get_confidence_distribution(&self) -> [u64; 10] {
        *self
            .confidence_buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Duration of the most recent artifact load
    pub fn get_last_load_time(&self) -> Option<Duration> {
        *self.load_time.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let ok = self.classifications.load(Ordering::Relaxed);
        let validation = self.validation_failures.load(Ordering::Relaxed);
        let artifact = self.artifact_failures.load(Ordering::Relaxed);
        let internal = self.internal_failures.load(Ordering::Relaxed);
        let loads = self.artifact_loads.load(Ordering::Relaxed);

        let latency = self.get_latency_stats();
        let throughput = self.get_throughput();
        let by_class = self.get_counts_by_class();
        let confidence = self.get_confidence_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║           EXOPLANET CLASSIFIER - METRICS SUMMARY             ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Classified: {:>8}  │  Throughput: {:>8.1} req/s            ║",
            ok, throughput
        );
        info!(
            "║ Rejected:   {:>8}  │  Load errors: {:>6}  │  Internal: {:>4} ║",
            validation, artifact, internal
        );
        match self.get_last_load_time() {
            Some(load) => info!(
                "║ Artifact loads: {:>4}  │  Last load: {:>8} ms                ║",
                loads,
                load.as_millis()
            ),
            None => info!("║ Artifact loads: {:>4}                                         ║", loads),
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Latency (μs): mean={:>5} p50={:>5} p95={:>5} p99={:>5}       ║",
            latency.mean_us, latency.p50_us, latency.p95_us, latency.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Classifications by Label:                                    ║");
        for (class, count) in &by_class {
            let pct = if ok > 0 {
                (*count as f64 / ok as f64) * 100.0
            } else {
                0.0
            };
            info!("║   {:14}: {:>6} ({:>5.1}%)                            ║", class.as_str(), count, pct);
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Confidence Distribution:                                     ║");
        let total: u64 = confidence.iter().sum();
        for (i, &count) in confidence.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: std::sync::Arc<ServiceMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: std::sync::Arc<ServiceMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
