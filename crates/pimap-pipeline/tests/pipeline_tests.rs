//! End-to-end tests for the Store + Analyze pipeline.

use async_trait::async_trait;
use pimap_analyze::{aggregate, AggregateFunction, ComputeError, FieldSelector, MetricRegistry};
use pimap_common::config::{GroupConfig, MetricDefinition, WindowConfig};
use pimap_common::{
    LateDataPolicy, MetricId, MetricRecord, MetricValue, PimapError, PipelineConfig, Result,
    Sample, SampleValue, ScopeId, StreamId, Timestamp,
};
use pimap_pipeline::{Datum, Pipeline};
use pimap_storage::{SampleSource, SampleStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn at(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::in_memory();
    config.engine.workers = 2;
    config.engine.retry_backoff_base_ms = 1;
    config.engine.retry_backoff_max_ms = 5;
    config
}

fn sum_registry() -> Arc<MetricRegistry> {
    let registry = MetricRegistry::new();
    registry
        .register_fn(
            "sum",
            None,
            aggregate(AggregateFunction::Sum, FieldSelector::Field(0)),
        )
        .unwrap();
    Arc::new(registry)
}

fn records(pipeline: &Pipeline, metric: &str, scope: &str) -> Vec<MetricRecord> {
    pipeline.get_metrics(
        &MetricId::new(metric),
        &ScopeId::new(scope),
        Timestamp::MIN,
        Timestamp::MAX,
    )
}

fn scalar(record: &MetricRecord) -> f64 {
    record
        .as_metric()
        .and_then(|m| m.value.as_scalar())
        .expect("expected a computed scalar metric")
}

async fn submit_all(pipeline: &Pipeline, stream: &str, points: &[(i64, f64)]) {
    for (ms, value) in points {
        pipeline.submit_sample(Sample::scalar(stream, at(*ms), *value)).unwrap();
    }
    pipeline.wait_idle().await;
}

// =============================================================================
// Windowing and Late Data
// =============================================================================

#[tokio::test]
async fn test_wrist_accel_sum_and_late_recompute() {
    let pipeline = Pipeline::open(config(), sum_registry()).await.unwrap();
    submit_all(
        &pipeline,
        "wrist_accel",
        &[(0, 1.0), (200, 2.0), (400, 3.0), (1_000, 0.0)],
    )
    .await;

    let first = records(&pipeline, "sum", "wrist_accel");
    assert_eq!(first.len(), 1);
    assert_eq!(scalar(&first[0]), 6.0);
    let first_version = first[0].as_metric().unwrap().inputs_version;

    // Behind the watermark: the window is reopened and evaluated again.
    submit_all(&pipeline, "wrist_accel", &[(500, 1.0)]).await;

    let second = records(&pipeline, "sum", "wrist_accel");
    assert_eq!(second.len(), 1);
    assert_eq!(scalar(&second[0]), 7.0);
    let second = second[0].as_metric().unwrap();
    assert_eq!(second.sample_count, 4);
    assert_ne!(second.inputs_version, first_version);

    let stats = pipeline.stats();
    assert_eq!(stats.late_events, 1);
    assert_eq!(stats.recomputations, 1);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_submission() {
    let pipeline = Pipeline::open(config(), sum_registry()).await.unwrap();
    let sample = Sample::scalar("s1", at(10), 5.0).with_sequence(1);

    pipeline.submit_sample(sample.clone()).unwrap();
    pipeline.submit_sample(sample.clone()).unwrap();
    let stored = pipeline.get_samples(&StreamId::new("s1"), Timestamp::MIN, Timestamp::MAX);
    assert_eq!(stored.len(), 1);

    let conflicting = Sample::scalar("s1", at(10), 6.0).with_sequence(1);
    assert!(matches!(
        pipeline.submit_sample(conflicting),
        Err(PimapError::DuplicateSample(_))
    ));

    let stats = pipeline.stats();
    assert_eq!(stats.samples_stored, 1);
    assert_eq!(stats.samples_unchanged, 1);
    assert_eq!(stats.samples_rejected, 1);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_evaluation_is_deterministic() {
    let points = [(0, 1.5), (300, -2.0), (999, 4.25), (1_001, 1.0)];
    let mut results = Vec::new();
    for _ in 0..2 {
        let pipeline = Pipeline::open(config(), sum_registry()).await.unwrap();
        submit_all(&pipeline, "s1", &points).await;
        let metric = records(&pipeline, "sum", "s1")[0].as_metric().cloned().unwrap();
        pipeline.shutdown().await.unwrap();
        results.push(metric);
    }
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn test_side_output_receives_late_sample() {
    let mut config = config();
    config.late_data_policy = LateDataPolicy::SideOutput;
    let pipeline = Pipeline::open(config, sum_registry()).await.unwrap();
    let mut late = pipeline.late_data();

    submit_all(&pipeline, "s1", &[(0, 1.0), (1_000, 1.0)]).await;
    submit_all(&pipeline, "s1", &[(500, 9.0)]).await;

    let event = tokio::time::timeout(Duration::from_secs(5), late.recv())
        .await
        .expect("no side-output event")
        .unwrap();
    assert_eq!(event.sample.timestamp, at(500));
    assert_eq!(event.window.start, at(0));
    assert_eq!(pipeline.late_history(10).len(), 1);

    // The late value never reaches the metric.
    assert_eq!(scalar(&records(&pipeline, "sum", "s1")[0]), 1.0);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_group_window_combines_members() {
    let mut config = config();
    config.groups.push(GroupConfig {
        id: "bed-7".to_string(),
        members: vec!["s1".to_string(), "s2".to_string()],
        window: None,
        late_data_policy: None,
    });
    let pipeline = Pipeline::open(config, sum_registry()).await.unwrap();

    submit_all(&pipeline, "s1", &[(0, 1.0), (1_000, 0.0)]).await;
    submit_all(&pipeline, "s2", &[(200, 2.0)]).await;
    // s2 still holds the group watermark back.
    assert!(records(&pipeline, "sum", "bed-7").is_empty());
    assert_eq!(scalar(&records(&pipeline, "sum", "s1")[0]), 1.0);

    submit_all(&pipeline, "s2", &[(1_100, 0.0)]).await;
    let group = records(&pipeline, "sum", "bed-7");
    assert_eq!(group.len(), 1);
    assert_eq!(scalar(&group[0]), 3.0);
    assert_eq!(group[0].as_metric().unwrap().sample_count, 2);
    pipeline.shutdown().await.unwrap();
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test]
async fn test_failing_metric_is_isolated() {
    let registry = sum_registry();
    registry
        .register_any("broken", |_, _| {
            Err(ComputeError::Domain("division by zero".to_string()))
        })
        .unwrap();
    let pipeline = Pipeline::open(config(), registry).await.unwrap();
    submit_all(&pipeline, "s1", &[(0, 2.0), (1_000, 0.0)]).await;

    assert_eq!(scalar(&records(&pipeline, "sum", "s1")[0]), 2.0);
    let broken = records(&pipeline, "broken", "s1");
    assert_eq!(broken.len(), 1);
    let failure = broken[0].as_failure().unwrap();
    assert!(failure.error.contains("division by zero"));

    let stats = pipeline.stats();
    assert_eq!(stats.metrics_written, 1);
    assert_eq!(stats.metrics_failed, 1);
    pipeline.shutdown().await.unwrap();
}

/// Sample source that fails its first reads with a transient error.
struct FlakySource {
    inner: Arc<SampleStore>,
    failures: AtomicU32,
}

#[async_trait]
impl SampleSource for FlakySource {
    async fn read_range(
        &self,
        stream: &StreamId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PimapError::StoreUnavailable("replica restarting".to_string()));
        }
        Ok(self.inner.read_range(stream, start, end))
    }
}

#[tokio::test]
async fn test_transient_read_failure_is_retried() {
    let pipeline = Pipeline::open_with(config(), sum_registry(), |store| {
        Arc::new(FlakySource {
            inner: store,
            failures: AtomicU32::new(1),
        }) as Arc<dyn SampleSource>
    })
    .await
    .unwrap();

    submit_all(&pipeline, "s1", &[(0, 4.0), (1_000, 0.0)]).await;
    let metrics = records(&pipeline, "sum", "s1");
    assert_eq!(metrics.len(), 1);
    assert_eq!(scalar(&metrics[0]), 4.0);
    pipeline.shutdown().await.unwrap();
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_resumes_open_windows() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
    let mut config = PipelineConfig::persistent(temp_dir.path());
    config.engine.workers = 1;

    let pipeline = Pipeline::open(config.clone(), sum_registry()).await.unwrap();
    submit_all(&pipeline, "s1", &[(0, 1.0), (500, 2.0), (999, 3.0)]).await;
    pipeline.shutdown().await.unwrap();
    drop(pipeline);
    assert!(config.storage.checkpoint_path().unwrap().exists());

    let pipeline = Pipeline::open(config.clone(), sum_registry()).await.unwrap();
    assert_eq!(pipeline.watermark(&StreamId::new("s1")), at(999));
    assert_eq!(pipeline.stats().windows.open, 1);

    submit_all(&pipeline, "s1", &[(1_000, 0.0)]).await;
    assert_eq!(scalar(&records(&pipeline, "sum", "s1")[0]), 6.0);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_evaluates_interrupted_windows() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
    let mut config = PipelineConfig::persistent(temp_dir.path());
    config.engine.workers = 1;

    // Reads keep failing and the backoff outlasts the test, so the closed
    // window is still unevaluated at shutdown.
    let mut stalled = config.clone();
    stalled.engine.retry_backoff_base_ms = 60_000;
    stalled.engine.retry_backoff_max_ms = 60_000;
    let pipeline = Pipeline::open_with(stalled, sum_registry(), |store| {
        Arc::new(FlakySource {
            inner: store,
            failures: AtomicU32::new(u32::MAX),
        }) as Arc<dyn SampleSource>
    })
    .await
    .unwrap();
    for (ms, value) in [(0, 2.0), (400, 2.0), (1_000, 0.0)] {
        pipeline.submit_sample(Sample::scalar("s1", at(ms), value)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.shutdown().await.unwrap();
    assert!(records(&pipeline, "sum", "s1").is_empty());
    assert_eq!(pipeline.stats().windows.closed, 1);
    drop(pipeline);

    let pipeline = Pipeline::open(config, sum_registry()).await.unwrap();
    pipeline.wait_idle().await;
    let metrics = records(&pipeline, "sum", "s1");
    assert_eq!(metrics.len(), 1);
    assert_eq!(scalar(&metrics[0]), 4.0);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_without_checkpoint_replays_samples() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
    let mut config = PipelineConfig::persistent(temp_dir.path());
    config.engine.workers = 1;

    let pipeline = Pipeline::open(config.clone(), sum_registry()).await.unwrap();
    submit_all(&pipeline, "s1", &[(0, 1.0), (999, 3.0), (1_500, 5.0), (2_000, 0.0)]).await;
    pipeline.shutdown().await.unwrap();
    drop(pipeline);
    std::fs::remove_file(config.storage.checkpoint_path().unwrap()).unwrap();

    let pipeline = Pipeline::open(config.clone(), sum_registry()).await.unwrap();
    pipeline.wait_idle().await;

    // Retired windows are evaluated again with identical results.
    let sums: Vec<f64> = records(&pipeline, "sum", "s1").iter().map(scalar).collect();
    assert_eq!(sums, vec![4.0, 5.0]);
    assert_eq!(pipeline.stats().metrics_written, 0);
    assert_eq!(pipeline.stats().metrics_unchanged, 2);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_replays_samples_after_checkpoint() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
    let mut config = PipelineConfig::persistent(temp_dir.path());
    config.engine.workers = 1;
    let checkpoint_path = config.storage.checkpoint_path().unwrap();
    let saved = temp_dir.path().join("saved-checkpoint.json");

    let pipeline = Pipeline::open(config.clone(), sum_registry()).await.unwrap();
    submit_all(&pipeline, "s1", &[(0, 1.0)]).await;
    pipeline.checkpoint().await.unwrap();
    std::fs::copy(&checkpoint_path, &saved).unwrap();

    submit_all(&pipeline, "s1", &[(1_500, 2.0), (1_600, 3.0)]).await;
    pipeline.shutdown().await.unwrap();
    drop(pipeline);

    // Crash after the mid-run checkpoint: only the earlier state survives.
    std::fs::rename(&saved, &checkpoint_path).unwrap();

    let pipeline = Pipeline::open(config.clone(), sum_registry()).await.unwrap();
    assert_eq!(pipeline.watermark(&StreamId::new("s1")), at(1_600));
    submit_all(&pipeline, "s1", &[(5_000, 0.0)]).await;

    let metrics = records(&pipeline, "sum", "s1");
    let starts: Vec<Timestamp> = metrics.iter().map(|r| r.window_start()).collect();
    assert_eq!(starts, vec![at(0), at(1_000)]);
    assert_eq!(scalar(&metrics[0]), 1.0);
    assert_eq!(scalar(&metrics[1]), 5.0);
    pipeline.shutdown().await.unwrap();
}

// =============================================================================
// Concurrent Producers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_on_one_stream() {
    let pipeline = Arc::new(Pipeline::open(config(), sum_registry()).await.unwrap());

    let producers: Vec<_> = (0..4u64)
        .map(|producer| {
            let pipeline = Arc::clone(&pipeline);
            tokio::task::spawn_blocking(move || {
                for k in 0..200u64 {
                    let ms = ((producer * 7 + k * 29) % 4_000) as i64;
                    let sample = Sample::scalar("s1", at(ms), 1.0)
                        .with_sequence(producer * 1_000 + k);
                    pipeline.submit_sample(sample).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    pipeline.finish_stream(&StreamId::new("s1")).unwrap();
    pipeline.wait_idle().await;

    // Every window's final value covers exactly the samples stored in it.
    let stream = StreamId::new("s1");
    let metrics = records(&pipeline, "sum", "s1");
    assert_eq!(metrics.len(), 4);
    for record in &metrics {
        let start = record.window_start();
        let stored = pipeline
            .get_samples(&stream, start, Timestamp::from_millis(start.as_millis() + 1_000))
            .len();
        assert_eq!(scalar(record), stored as f64, "window {}", start);
    }
    let total: f64 = metrics.iter().map(scalar).sum();
    assert_eq!(total, 800.0);
    pipeline.shutdown().await.unwrap();
}

// =============================================================================
// PIMAP Data Format
// =============================================================================

fn bandage(seconds: f64, tilted: bool) -> String {
    let rows: Vec<String> = (0..4)
        .map(|_| {
            let cells: Vec<String> = (0..4)
                .map(|x| if tilted { (x * 30).to_string() } else { "0".to_string() })
                .collect();
            format!("[{}]", cells.join(", "))
        })
        .collect();
    format!(
        "sample_type:pressure_bandage;patient_id:1;device_id:2;\
         sample:{{'pressure_bandage': [{}]}};timestamp:{:?};;",
        rows.join(", "),
        seconds
    )
}

#[tokio::test]
async fn test_pressure_bandage_mobility() {
    let mut config = config();
    config.window = WindowConfig::fixed(60_000);
    config.metrics.push(MetricDefinition {
        id: "objective_mobility".to_string(),
        function: "objective_mobility".to_string(),
        field: None,
        kind: None,
        max_pressure: None,
        movement_threshold: None,
    });
    let pipeline = Pipeline::open(config, Arc::new(MetricRegistry::new()))
        .await
        .unwrap();

    let base = 1_571_173_200.0;
    let input: String = [(1.0, false), (2.0, true), (3.0, false), (4.0, true), (61.0, false)]
        .iter()
        .map(|(offset, tilted)| bandage(base + offset, *tilted))
        .collect();
    for datum in Datum::parse_all(&input) {
        pipeline.submit_sample(datum.unwrap().to_sample().unwrap()).unwrap();
    }
    pipeline.wait_idle().await;

    let stream = StreamId::new("pressure_bandage/1/2");
    assert_eq!(
        pipeline.latest_sample(&stream).unwrap().value,
        SampleValue(vec![0.0; 16])
    );

    let metrics = records(&pipeline, "objective_mobility", "pressure_bandage/1/2");
    assert_eq!(metrics.len(), 1);
    let metric = metrics[0].as_metric().unwrap();
    assert_eq!(metric.sample_count, 4);
    let MetricValue::Fields(fields) = &metric.value else {
        panic!("expected field metric, got {:?}", metric.value);
    };
    assert!(fields.contains_key("x_angle"));
    assert!(fields["movements_per_min"] > 0.0);

    let encoded = Datum::from_metric(metric).encode();
    assert!(encoded.starts_with("metric_type:objective_mobility;patient_id:1;device_id:2;"));
    assert!(encoded.ends_with(";timestamp:1571173200.0;;"));
    pipeline.shutdown().await.unwrap();
}
