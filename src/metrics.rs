//! Time-bucketed performance metrics
//!
//! Samples are keyed by name and time bucket and retained for a bounded
//! window (default 24 hours). `analyze_performance` summarizes the samples
//! inside a trailing window.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::types::{now_millis, Details, Metric, PerformanceSummary};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage for bucketed samples and error counters
///
/// Increments to the same bucket must be atomic.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn append(&self, bucket: u64, metric: Metric) -> Result<()>;

    /// Add `by` to a named counter, returning the bucket's new value
    async fn increment(&self, name: &str, bucket: u64, by: u64) -> Result<u64>;

    /// Samples in buckets `>= from_bucket`
    async fn samples(&self, name: &str, from_bucket: u64) -> Result<Vec<Metric>>;

    /// Sum of a counter over buckets `>= from_bucket`
    async fn counter(&self, name: &str, from_bucket: u64) -> Result<u64>;

    /// Drop every bucket older than `bucket`, returning how many were dropped
    async fn evict_before(&self, bucket: u64) -> Result<usize>;
}

#[derive(Default)]
struct MetricsState {
    samples: HashMap<String, BTreeMap<u64, Vec<Metric>>>,
    counters: HashMap<String, BTreeMap<u64, u64>>,
}

/// In-memory metrics store
#[derive(Clone, Default)]
pub struct MemoryMetricsStore {
    state: Arc<RwLock<MetricsState>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn append(&self, bucket: u64, metric: Metric) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .samples
            .entry(metric.name.clone())
            .or_default()
            .entry(bucket)
            .or_default()
            .push(metric);
        Ok(())
    }

    async fn increment(&self, name: &str, bucket: u64, by: u64) -> Result<u64> {
        let mut state = self.state.write().await;
        let count = state
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(bucket)
            .or_default();
        *count += by;
        Ok(*count)
    }

    async fn samples(&self, name: &str, from_bucket: u64) -> Result<Vec<Metric>> {
        let state = self.state.read().await;
        Ok(state
            .samples
            .get(name)
            .map(|buckets| {
                buckets
                    .range(from_bucket..)
                    .flat_map(|(_, metrics)| metrics.iter().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn counter(&self, name: &str, from_bucket: u64) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .counters
            .get(name)
            .map(|buckets| buckets.range(from_bucket..).map(|(_, c)| *c).sum())
            .unwrap_or(0))
    }

    async fn evict_before(&self, bucket: u64) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut evicted = 0;

        for buckets in state.samples.values_mut() {
            let kept = buckets.split_off(&bucket);
            evicted += buckets.len();
            *buckets = kept;
        }
        state.samples.retain(|_, buckets| !buckets.is_empty());

        for buckets in state.counters.values_mut() {
            let kept = buckets.split_off(&bucket);
            evicted += buckets.len();
            *buckets = kept;
        }
        state.counters.retain(|_, buckets| !buckets.is_empty());

        Ok(evicted)
    }
}

/// Summary statistics of a set of samples
///
/// p95 sorts ascending and takes index `floor(count * 0.95)`, which is biased
/// low for small sample sizes. Do not swap in an interpolating percentile:
/// consumers compare against values computed this way. An empty input
/// yields an all-zero summary.
pub fn summarize(values: &[f64]) -> PerformanceSummary {
    if values.is_empty() {
        return PerformanceSummary::default();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let p95_index = ((count as f64 * 0.95).floor() as usize).min(count - 1);

    PerformanceSummary {
        count,
        avg: sum / count as f64,
        min: sorted[0],
        max: sorted[count - 1],
        p95: sorted[p95_index],
    }
}

/// Records samples and error counters, and analyzes them over windows
pub struct MetricsRecorder {
    store: Arc<dyn MetricsStore>,
    retention_seconds: u64,
    bucket_seconds: u64,
}

impl MetricsRecorder {
    pub fn new(config: &PipelineConfig, store: Arc<dyn MetricsStore>) -> Self {
        Self {
            store,
            retention_seconds: config.metrics_retention_seconds,
            bucket_seconds: config.metrics_bucket_seconds.max(1),
        }
    }

    /// In-memory recorder with default retention
    pub fn in_memory() -> Self {
        Self::new(&PipelineConfig::default(), Arc::new(MemoryMetricsStore::new()))
    }

    pub fn retention_seconds(&self) -> u64 {
        self.retention_seconds
    }

    fn bucket_of(&self, timestamp_ms: u64) -> u64 {
        timestamp_ms / 1000 / self.bucket_seconds
    }

    /// Cutoff timestamp (ms) for a trailing window
    fn window_start(&self, window_seconds: u64) -> u64 {
        now_millis().saturating_sub(window_seconds.saturating_mul(1000))
    }

    /// Record a sample stamped with the current time
    pub async fn record_metric(&self, name: &str, value: f64, context: Details) -> Result<()> {
        self.record(Metric::new(name, value, context)).await
    }

    /// Record a sample with its own timestamp
    ///
    /// Fails only when the sample was not stored. Eviction failures are logged.
    pub async fn record(&self, metric: Metric) -> Result<()> {
        let bucket = self.bucket_of(metric.timestamp);
        self.store.append(bucket, metric).await?;
        if let Err(e) = self.evict_expired().await {
            tracing::warn!(error = %e, "Failed to evict expired metric buckets");
        }
        Ok(())
    }

    /// Increment the named error counter, returning the current bucket's count
    pub async fn record_error(&self, name: &str, context: Details) -> Result<u64> {
        let bucket = self.bucket_of(now_millis());
        let count = self.store.increment(name, bucket, 1).await?;
        tracing::debug!(
            metric = %name,
            count,
            context = %serde_json::Value::Object(context),
            "Error recorded"
        );
        Ok(count)
    }

    /// Samples recorded within the last `window_seconds`, oldest first
    pub async fn get_metrics(&self, name: &str, window_seconds: u64) -> Result<Vec<Metric>> {
        let start = self.window_start(window_seconds);
        let mut metrics: Vec<Metric> = self
            .store
            .samples(name, self.bucket_of(start))
            .await?
            .into_iter()
            .filter(|m| m.timestamp >= start)
            .collect();
        metrics.sort_by_key(|m| m.timestamp);
        Ok(metrics)
    }

    /// Count, average, min, max and p95 over the trailing window
    pub async fn analyze_performance(
        &self,
        name: &str,
        window_seconds: u64,
    ) -> Result<PerformanceSummary> {
        let values: Vec<f64> = self
            .get_metrics(name, window_seconds)
            .await?
            .iter()
            .map(|m| m.value)
            .collect();
        Ok(summarize(&values))
    }

    /// Errors counted in buckets overlapping the trailing window
    pub async fn error_count(&self, name: &str, window_seconds: u64) -> Result<u64> {
        let start = self.window_start(window_seconds);
        self.store.counter(name, self.bucket_of(start)).await
    }

    /// Drop buckets that fell out of the retention window
    pub async fn evict_expired(&self) -> Result<usize> {
        let cutoff = self.bucket_of(self.window_start(self.retention_seconds));
        let evicted = self.store.evict_before(cutoff).await?;
        if evicted > 0 {
            tracing::debug!(evicted, "Expired metric buckets evicted");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(operation_type: &str) -> Details {
        let mut context = Details::new();
        context.insert("operationType".to_string(), serde_json::json!(operation_type));
        context
    }

    #[test]
    fn test_summarize_empty_is_all_zero() {
        let summary = summarize(&[]);
        assert_eq!(
            summary,
            PerformanceSummary {
                count: 0,
                avg: 0.0,
                min: 0.0,
                max: 0.0,
                p95: 0.0
            }
        );
    }

    #[test]
    fn test_summarize_p95_index() {
        // floor(5 * 0.95) = 4
        let summary = summarize(&[30.0, 10.0, 50.0, 20.0, 40.0]);
        assert_eq!(summary.count, 5);
        assert_eq!(summary.avg, 30.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 50.0);
        assert_eq!(summary.p95, 50.0);

        // floor(20 * 0.95) = 19 -> last element; floor(10 * 0.95) = 9
        let twenty: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(summarize(&twenty).p95, 20.0);
        let ten: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(summarize(&ten).p95, 10.0);

        // floor(100 * 0.95) = 95 -> 96th smallest
        let hundred: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(summarize(&hundred).p95, 96.0);

        assert_eq!(summarize(&[7.0]).p95, 7.0);
    }

    #[tokio::test]
    async fn test_analyze_performance_over_window() {
        let recorder = MetricsRecorder::in_memory();
        for value in [10.0, 20.0, 30.0, 40.0, 50.0] {
            recorder
                .record_metric("operation.duration_ms", value, tagged("content.create"))
                .await
                .unwrap();
        }

        let summary = recorder
            .analyze_performance("operation.duration_ms", 3600)
            .await
            .unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.avg, 30.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 50.0);
        assert_eq!(summary.p95, 50.0);

        let empty = recorder.analyze_performance("unknown", 3600).await.unwrap();
        assert_eq!(empty, PerformanceSummary::default());
    }

    #[tokio::test]
    async fn test_window_excludes_old_samples() {
        let recorder = MetricsRecorder::in_memory();
        let now = now_millis();
        recorder
            .record(Metric::at("latency", 999.0, now - 7_200_000, Details::new()))
            .await
            .unwrap();
        recorder
            .record(Metric::at("latency", 5.0, now, Details::new()))
            .await
            .unwrap();

        let recent = recorder.get_metrics("latency", 3600).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].value, 5.0);

        let all = recorder.get_metrics("latency", 86_400).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, 999.0);
    }

    #[tokio::test]
    async fn test_retention_evicts_expired_buckets() {
        let store = MemoryMetricsStore::new();
        let config = PipelineConfig::default().with_metrics_retention_seconds(3600);
        let recorder = MetricsRecorder::new(&config, Arc::new(store.clone()));
        let now = now_millis();

        // Written straight to the store, bypassing eviction on record
        store
            .append(
                recorder.bucket_of(now - 7_200_000),
                Metric::at("latency", 1.0, now - 7_200_000, Details::new()),
            )
            .await
            .unwrap();
        assert_eq!(store.samples("latency", 0).await.unwrap().len(), 1);

        recorder
            .record(Metric::at("latency", 2.0, now, Details::new()))
            .await
            .unwrap();

        let remaining = store.samples("latency", 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, 2.0);
    }

    /// Stores samples but cannot evict
    struct StuckEvictionStore(MemoryMetricsStore);

    #[async_trait]
    impl MetricsStore for StuckEvictionStore {
        async fn append(&self, bucket: u64, metric: Metric) -> Result<()> {
            self.0.append(bucket, metric).await
        }

        async fn increment(&self, name: &str, bucket: u64, by: u64) -> Result<u64> {
            self.0.increment(name, bucket, by).await
        }

        async fn samples(&self, name: &str, from_bucket: u64) -> Result<Vec<Metric>> {
            self.0.samples(name, from_bucket).await
        }

        async fn counter(&self, name: &str, from_bucket: u64) -> Result<u64> {
            self.0.counter(name, from_bucket).await
        }

        async fn evict_before(&self, _bucket: u64) -> Result<usize> {
            Err(crate::error::GuardError::Storage("bucket index locked".to_string()))
        }
    }

    #[tokio::test]
    async fn test_eviction_failure_keeps_recorded_sample() {
        let store = MemoryMetricsStore::new();
        let recorder = MetricsRecorder::new(
            &PipelineConfig::default(),
            Arc::new(StuckEvictionStore(store.clone())),
        );

        recorder
            .record_metric("latency", 12.5, Details::new())
            .await
            .unwrap();
        assert!(recorder.evict_expired().await.is_err());

        let samples = recorder.get_metrics("latency", 3600).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 12.5);
    }

    #[tokio::test]
    async fn test_error_counter() {
        let recorder = MetricsRecorder::in_memory();
        assert_eq!(recorder.record_error("operation.errors", tagged("a")).await.unwrap(), 1);
        recorder.record_error("operation.errors", tagged("a")).await.unwrap();
        assert_eq!(recorder.error_count("operation.errors", 60).await.unwrap(), 2);
        assert_eq!(recorder.error_count("other.errors", 60).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let recorder = Arc::new(MetricsRecorder::in_memory());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                recorder.record_error("burst", Details::new()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(recorder.error_count("burst", 3600).await.unwrap(), 50);
    }
}
